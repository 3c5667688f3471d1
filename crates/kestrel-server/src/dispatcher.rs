use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use kestrel_common::protocol::{ErrorInfo, ErrorInfoKind, RpcRequest, RpcResponse, TypeDescriptor};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Why a handler could not produce a result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceFailure {
    /// The parameters do not fit the method
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The method ran and failed; sent back as an application exception
    #[error("{0}")]
    Application(String),
}

impl ServiceFailure {
    pub fn application(message: impl Into<String>) -> Self {
        ServiceFailure::Application(message.into())
    }
}

/// Parameters of one call, decoded on demand.
#[derive(Debug, Clone)]
pub struct Params {
    request: RpcRequest,
}

impl Params {
    pub fn new(request: RpcRequest) -> Self {
        Self { request }
    }

    /// Decodes parameter `index`; a missing or mistyped parameter is a bad request.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T, ServiceFailure> {
        self.request
            .param(index)
            .map_err(|e| ServiceFailure::BadRequest(e.to_string()))
    }

    pub fn len(&self) -> usize {
        self.request.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.request.parameters.is_empty()
    }

    pub fn types(&self) -> &[TypeDescriptor] {
        &self.request.parameter_types
    }

    pub fn request_id(&self) -> &str {
        &self.request.request_id
    }
}

/// An encoded handler result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    data: Vec<u8>,
    data_type: TypeDescriptor,
}

impl Payload {
    pub fn new<T: Serialize + ?Sized>(value: &T) -> Result<Self, ServiceFailure> {
        let data = serde_json::to_vec(value)
            .map_err(|e| ServiceFailure::Application(format!("cannot encode result: {}", e)))?;
        Ok(Self {
            data,
            data_type: TypeDescriptor::of::<T>(),
        })
    }

    /// A payload carrying no value (`null`).
    pub fn empty() -> Self {
        Self {
            data: b"null".to_vec(),
            data_type: TypeDescriptor::of::<()>(),
        }
    }
}

pub type HandlerFuture = BoxFuture<'static, Result<Payload, ServiceFailure>>;
pub type Handler = Arc<dyn Fn(Params) -> HandlerFuture + Send + Sync>;

/// Dispatch table mapping `(service, method)` to a handler.
///
/// Filled in at startup and shared read-only behind an `Arc` once the server
/// runs. Unknown services and methods are answered with `ServiceNotFound` /
/// `MethodNotFound` exceptions rather than transport failures.
///
/// # Example
///
/// ```
/// use kestrel_server::{Dispatcher, Payload};
///
/// let mut dispatcher = Dispatcher::new();
/// dispatcher.register("MathService", "add", |params| async move {
///     let a: i64 = params.get(0)?;
///     let b: i64 = params.get(1)?;
///     Payload::new(&(a + b))
/// });
/// assert_eq!(dispatcher.services(), vec!["MathService"]);
/// ```
#[derive(Default, Clone)]
pub struct Dispatcher {
    services: BTreeMap<String, BTreeMap<String, Handler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `service.method`, replacing any previous one.
    pub fn register<F, Fut>(&mut self, service: impl Into<String>, method: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, ServiceFailure>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |params: Params| -> HandlerFuture { handler(params).boxed() });
        self.services
            .entry(service.into())
            .or_default()
            .insert(method.into(), handler);
        self
    }

    /// Names of all services with at least one method, sorted.
    pub fn services(&self) -> Vec<&str> {
        self.services.keys().map(String::as_str).collect()
    }

    pub fn methods(&self, service: &str) -> Vec<&str> {
        self.services
            .get(service)
            .map(|methods| methods.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Runs the handler for `request` and wraps the outcome in a response.
    pub async fn dispatch(&self, request: RpcRequest) -> RpcResponse {
        let request_id = request.request_id.clone();

        let Some(methods) = self.services.get(&request.service_name) else {
            tracing::debug!(service = %request.service_name, "Unknown service");
            return RpcResponse::failure(
                request_id,
                ErrorInfo::new(
                    ErrorInfoKind::ServiceNotFound,
                    format!("service '{}' is not registered", request.service_name),
                ),
            );
        };

        let Some(handler) = methods.get(&request.method_name) else {
            tracing::debug!(service = %request.service_name, method = %request.method_name, "Unknown method");
            return RpcResponse::failure(
                request_id,
                ErrorInfo::new(
                    ErrorInfoKind::MethodNotFound,
                    format!("method '{}.{}' is not registered", request.service_name, request.method_name),
                ),
            );
        };

        let service = request.service_name.clone();
        let method = request.method_name.clone();
        tracing::debug!(%service, %method, %request_id, "Dispatching");

        // A panicking handler must not take the connection down with it
        let outcome = AssertUnwindSafe(handler(Params::new(request))).catch_unwind().await;

        match outcome {
            Ok(Ok(payload)) => RpcResponse::success(request_id, payload.data, payload.data_type),
            Ok(Err(ServiceFailure::BadRequest(message))) => {
                RpcResponse::failure(request_id, ErrorInfo::new(ErrorInfoKind::BadRequest, message))
            }
            Ok(Err(ServiceFailure::Application(message))) => {
                tracing::debug!(%service, %method, error = %message, "Handler failed");
                RpcResponse::failure(request_id, ErrorInfo::new(ErrorInfoKind::Application, message))
            }
            Err(_) => {
                tracing::error!(%service, %method, "Handler panicked");
                RpcResponse::failure(
                    request_id,
                    ErrorInfo::new(ErrorInfoKind::Application, format!("{}.{} panicked", service, method)),
                )
            }
        }
    }
}
