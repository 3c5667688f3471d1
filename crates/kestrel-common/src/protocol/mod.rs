pub mod error;
pub mod metadata;
pub mod requests;
pub mod responses;

#[cfg(test)]
mod tests;

pub use error::{ErrorKind, LoadBalancerError, RegistryError, RpcError, Stage, TransportError};
pub use metadata::{ServiceMetadata, SERVICE_KEY_PREFIX};
pub use requests::{RequestId, RpcRequest, RpcRequestBuilder, TypeDescriptor};
pub use responses::{ErrorInfo, ErrorInfoKind, RpcResponse};
