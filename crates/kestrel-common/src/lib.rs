//! Kestrel Common Types and Transport
//!
//! This crate provides the protocol definitions, codec and framed TCP transport
//! shared by every Kestrel component.
//!
//! # Overview
//!
//! Kestrel lets a caller invoke a method on a remote service as if it were
//! local. This crate holds the pieces both sides of a call agree on:
//!
//! - **Protocol Layer**: request/response envelopes, instance metadata, errors
//! - **Transport Layer**: length-prefixed TCP framing with a pluggable body codec
//! - **Configuration**: the resolved configuration struct the core consumes
//!
//! # Wire Format
//!
//! - **Transport**: TCP with keep-alive connections
//! - **Frame**: `[4-byte length as u32 big-endian] [1-byte format tag] [body]`
//! - **Body**: JSON or postcard, chosen by the caller; replies mirror the request
//! - **Max Message Size**: 100 MB
//!
//! # Example
//!
//! ```
//! use kestrel_common::{Codec, RpcRequest, RpcResponse};
//!
//! let request = RpcRequest::builder("UserService", "getUser")
//!     .param(&42u64)
//!     .unwrap()
//!     .build();
//!
//! let codec = Codec::json();
//! let bytes = codec.encode_request(&request).unwrap();
//! let decoded = Codec::decode_request(&bytes).unwrap();
//! assert_eq!(request, decoded);
//!
//! let response = RpcResponse::success_value(&request.request_id, &"alice").unwrap();
//! assert!(response.exception.is_none());
//! ```

pub mod config;
pub mod protocol;
pub mod transport;

pub use config::{
    LoadBalancerKind, PoolConfig, RegistryConfig, RegistryKind, RetryConfig, RetryStrategyKind,
    RpcConfig, SerializerKind,
};
pub use protocol::*;
pub use transport::{Codec, TcpServer, TcpTransportAsync};
