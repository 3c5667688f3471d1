use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::SystemTime;

use super::error::TransportError;

pub type RequestId = String;

static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Random per process, so processes sharing a clock still get distinct ids
static PROCESS_SEED: OnceLock<u64> = OnceLock::new();

/// Names the type of an encoded value (e.g. `"u64"`, `"alloc::string::String"`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeDescriptor(pub String);

impl TypeDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        TypeDescriptor(name.into())
    }

    pub fn of<T: ?Sized>() -> Self {
        TypeDescriptor(std::any::type_name::<T>().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A call to `method_name` on `service_name`.
///
/// Each parameter is carried as an independently encoded JSON value next to
/// its type descriptor, so the envelope decodes without any schema lookup.
/// Requests are immutable once built; `request_id` correlates the reply and
/// keys consistent-hash routing when no affinity key is given.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcRequest {
    pub service_name: String,
    pub method_name: String,
    pub parameter_types: Vec<TypeDescriptor>,
    pub parameters: Vec<Vec<u8>>,
    pub request_id: RequestId,
}

impl RpcRequest {
    pub fn builder(
        service_name: impl Into<String>,
        method_name: impl Into<String>,
    ) -> RpcRequestBuilder {
        RpcRequestBuilder {
            service_name: service_name.into(),
            method_name: method_name.into(),
            parameter_types: Vec::new(),
            parameters: Vec::new(),
        }
    }

    /// Decodes parameter `index` as `T`.
    pub fn param<T: serde::de::DeserializeOwned>(&self, index: usize) -> Result<T, TransportError> {
        let raw = self.parameters.get(index).ok_or_else(|| {
            TransportError::Codec(format!(
                "missing parameter {} for {}.{}",
                index, self.service_name, self.method_name
            ))
        })?;
        serde_json::from_slice(raw).map_err(|e| TransportError::Codec(e.to_string()))
    }
}

pub struct RpcRequestBuilder {
    service_name: String,
    method_name: String,
    parameter_types: Vec<TypeDescriptor>,
    parameters: Vec<Vec<u8>>,
}

impl RpcRequestBuilder {
    /// Appends a parameter, recording its Rust type name.
    pub fn param<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self, TransportError> {
        let encoded = serde_json::to_vec(value).map_err(|e| TransportError::Codec(e.to_string()))?;
        self.parameter_types.push(TypeDescriptor::of::<T>());
        self.parameters.push(encoded);
        Ok(self)
    }

    /// Appends an already-encoded JSON parameter.
    pub fn raw_param(mut self, type_descriptor: TypeDescriptor, encoded: Vec<u8>) -> Self {
        self.parameter_types.push(type_descriptor);
        self.parameters.push(encoded);
        self
    }

    pub fn build(self) -> RpcRequest {
        RpcRequest {
            service_name: self.service_name,
            method_name: self.method_name,
            parameter_types: self.parameter_types,
            parameters: self.parameters,
            request_id: generate_request_id(),
        }
    }
}

fn generate_request_id() -> RequestId {
    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let seed = *PROCESS_SEED.get_or_init(rand::random);
    let counter = REQUEST_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    compose_request_id(timestamp, seed, counter)
}

/// The full clock reading, then the process seed advanced by the counter.
pub(crate) fn compose_request_id(timestamp: u64, seed: u64, counter: u64) -> RequestId {
    format!("{:016x}{:016x}", timestamp, seed.wrapping_add(counter))
}
