//! Kestrel Response Types
//!
//! This module defines the RPC response envelope.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::TransportError;
use super::requests::{RequestId, TypeDescriptor};

/// What went wrong on the provider side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorInfoKind {
    /// No service of that name is exported by the provider
    ServiceNotFound,
    /// The service exists but has no such method
    MethodNotFound,
    /// The request could not be decoded or its parameters were invalid
    BadRequest,
    /// The method itself failed
    Application,
}

/// Error detail carried inside a successfully transported response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorInfoKind,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: ErrorInfoKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// An RPC response returned from a provider to the caller.
///
/// # Response Flow
///
/// 1. Provider receives and decodes an `RpcRequest`
/// 2. The dispatch table runs the matching method (or reports why it can't)
/// 3. The outcome is wrapped in an `RpcResponse`, encoded and framed
/// 4. The caller decodes it and checks `request_id` against its request
///
/// A response carries either a payload (`data` + `data_type`) or an
/// `exception`, never both.
///
/// # Example
///
/// ```
/// use kestrel_common::protocol::{ErrorInfo, ErrorInfoKind, RpcResponse};
///
/// let ok = RpcResponse::success_value("req-1", &3.14159).unwrap();
/// assert!(ok.is_success());
///
/// let failed = RpcResponse::failure("req-1", ErrorInfo::new(ErrorInfoKind::Application, "boom"));
/// assert!(!failed.is_success());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Request identifier this response corresponds to
    pub request_id: RequestId,
    /// Encoded result (empty on failure)
    pub data: Vec<u8>,
    /// Type of the encoded result
    pub data_type: TypeDescriptor,
    /// Human-readable status line
    pub message: String,
    /// Error detail (present on failure)
    pub exception: Option<ErrorInfo>,
}

impl RpcResponse {
    pub fn success(request_id: impl Into<String>, data: Vec<u8>, data_type: TypeDescriptor) -> Self {
        RpcResponse {
            request_id: request_id.into(),
            data,
            data_type,
            message: "ok".to_string(),
            exception: None,
        }
    }

    /// Creates a successful response holding `value` encoded as JSON.
    pub fn success_value<T: Serialize + ?Sized>(
        request_id: impl Into<String>,
        value: &T,
    ) -> Result<Self, TransportError> {
        let data = serde_json::to_vec(value).map_err(|e| TransportError::Codec(e.to_string()))?;
        Ok(Self::success(request_id, data, TypeDescriptor::of::<T>()))
    }

    pub fn failure(request_id: impl Into<String>, exception: ErrorInfo) -> Self {
        RpcResponse {
            request_id: request_id.into(),
            data: Vec::new(),
            data_type: TypeDescriptor::default(),
            message: exception.message.clone(),
            exception: Some(exception),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exception.is_none()
    }

    /// Decodes the JSON payload as `T`.
    pub fn value<T: serde::de::DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_slice(&self.data).map_err(|e| TransportError::Codec(e.to_string()))
    }
}
