use std::sync::Arc;

use kestrel_common::config::RpcConfig;
use kestrel_common::protocol::{RpcError, RpcRequest, Stage, TypeDescriptor};
use kestrel_registry::{Registry, RegistryClient};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::invoker::{CallOptions, Invoker};

/// Kestrel client for making RPC calls
///
/// Thin typed layer over an [`Invoker`]: builds the request, runs it through
/// the invocation pipeline and decodes the result. Cheap to clone; clones
/// share the invoker, so they share round-robin counters and pooled
/// connections.
#[derive(Clone)]
pub struct KestrelClient {
    invoker: Arc<Invoker>,
}

impl KestrelClient {
    /// Connects to the configured registry and builds a client over it.
    pub async fn connect(config: &RpcConfig) -> Result<Self, RpcError> {
        let registry = RegistryClient::connect(&config.registry)
            .await
            .map_err(|source| RpcError::Registry {
                stage: Stage::Resolve,
                source,
            })?;
        Ok(Self::with_registry(config, Arc::new(registry)))
    }

    pub fn with_registry(config: &RpcConfig, registry: Arc<dyn Registry>) -> Self {
        Self::new(Invoker::new(config, registry))
    }

    pub fn new(invoker: Invoker) -> Self {
        Self {
            invoker: Arc::new(invoker),
        }
    }

    pub fn invoker(&self) -> &Invoker {
        &self.invoker
    }

    /// Calls `service.method` with JSON parameters and decodes the result as `R`.
    pub async fn call<R: DeserializeOwned>(
        &self,
        service: &str,
        method: &str,
        params: &[Value],
    ) -> Result<R, RpcError> {
        let request = Self::request(service, method, params)?;
        self.call_with(request, CallOptions::default()).await
    }

    /// Builds a request from JSON parameters, one encoded parameter per value.
    pub fn request(service: &str, method: &str, params: &[Value]) -> Result<RpcRequest, RpcError> {
        build_request(service, method, params)
    }

    /// Runs a prepared request with explicit call options.
    pub async fn call_with<R: DeserializeOwned>(&self, request: RpcRequest, options: CallOptions) -> Result<R, RpcError> {
        let response = self.invoker.invoke_with(request, options).await?;
        response.value().map_err(|e| RpcError::Codec {
            stage: Stage::Send,
            message: format!("cannot decode result of type {}: {}", response.data_type.as_str(), e),
        })
    }
}

fn build_request(service: &str, method: &str, params: &[Value]) -> Result<RpcRequest, RpcError> {
    let mut builder = RpcRequest::builder(service, method);
    for param in params {
        let encoded = serde_json::to_vec(param).map_err(|e| RpcError::Codec {
            stage: Stage::Send,
            message: e.to_string(),
        })?;
        builder = builder.raw_param(TypeDescriptor::new(json_type_name(param)), encoded);
    }
    Ok(builder.build())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "f64",
        Value::Number(n) if n.is_u64() => "u64",
        Value::Number(_) => "i64",
        Value::String(_) => "String",
        Value::Array(_) => "Vec",
        Value::Object(_) => "Map",
    }
}
