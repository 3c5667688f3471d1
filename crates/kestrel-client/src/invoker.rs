use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use kestrel_common::config::RpcConfig;
use kestrel_common::protocol::{RegistryError, RpcError, RpcRequest, RpcResponse, ServiceMetadata, Stage};
use kestrel_common::transport::Codec;
use kestrel_registry::{Registry, WatchCallback};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::load_balancer::LoadBalancer;
use crate::retry::{RetryContext, RetryStrategy};
use crate::transport::{ClientTransport, PooledTcpTransport};

/// Per-call knobs.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Consistent-hash routing key; the request id when unset
    pub affinity_key: Option<String>,
    /// Absolute deadline covering every attempt and backoff of the call
    pub deadline: Option<Instant>,
}

impl CallOptions {
    pub fn with_affinity_key(mut self, key: impl Into<String>) -> Self {
        self.affinity_key = Some(key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }
}

/// Turns a request into a response from one live instance.
///
/// # Pipeline
///
/// Every attempt runs `Resolve -> Select -> Send`:
///
/// 1. **Resolve**: the registry's (cached) instance list for the service
/// 2. **Select**: the load balancer picks one instance, skipping instances
///    that already failed during this call while others remain
/// 3. **Send**: encode, exchange over the transport, decode, and check the
///    reply belongs to this request
///
/// The retry strategy wraps the whole attempt, so a retry re-resolves and
/// re-selects instead of hammering the instance that just failed.
///
/// The first successful resolve of a service also watches its membership;
/// instances that leave the registry are dropped from the transport.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use kestrel_client::Invoker;
/// use kestrel_common::config::RpcConfig;
/// use kestrel_common::protocol::RpcRequest;
/// use kestrel_registry::RegistryClient;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = RpcConfig::default();
/// let registry = RegistryClient::connect(&config.registry).await?;
/// let invoker = Invoker::new(&config, Arc::new(registry));
///
/// let request = RpcRequest::builder("UserService", "getUser").param(&1u64)?.build();
/// let response = invoker.invoke(request).await?;
/// # Ok(())
/// # }
/// ```
pub struct Invoker {
    registry: Arc<dyn Registry>,
    load_balancer: LoadBalancer,
    retry: RetryStrategy,
    transport: Arc<dyn ClientTransport>,
    codec: Codec,
    call_timeout: Duration,
    exclude_failed_on_retry: bool,
    /// Services whose membership is watched
    tracked: Mutex<HashSet<String>>,
}

impl Invoker {
    /// Builds an invoker over pooled TCP connections.
    pub fn new(config: &RpcConfig, registry: Arc<dyn Registry>) -> Self {
        Self::with_transport(config, registry, Arc::new(PooledTcpTransport::new(config.pool.clone())))
    }

    pub fn with_transport(config: &RpcConfig, registry: Arc<dyn Registry>, transport: Arc<dyn ClientTransport>) -> Self {
        Self {
            registry,
            load_balancer: LoadBalancer::new(config.load_balancer),
            retry: RetryStrategy::from_config(config.retry_strategy, &config.retry),
            transport,
            codec: Codec::from_kind(config.serializer),
            call_timeout: config.call_timeout(),
            exclude_failed_on_retry: config.exclude_failed_on_retry,
            tracked: Mutex::new(HashSet::new()),
        }
    }

    /// Replaces the configured retry strategy.
    pub fn with_retry(mut self, retry: RetryStrategy) -> Self {
        self.retry = retry;
        self
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    pub fn load_balancer(&self) -> &LoadBalancer {
        &self.load_balancer
    }

    pub async fn invoke(&self, request: RpcRequest) -> Result<RpcResponse, RpcError> {
        self.invoke_with(request, CallOptions::default()).await
    }

    pub async fn invoke_with(&self, request: RpcRequest, options: CallOptions) -> Result<RpcResponse, RpcError> {
        let failed = Mutex::new(HashSet::new());
        let result = self
            .retry
            .execute(options.deadline, |ctx| self.attempt(&request, &options, &failed, ctx))
            .await;

        match &result {
            Ok(_) => debug!(
                service = %request.service_name,
                method = %request.method_name,
                request_id = %request.request_id,
                "Call succeeded"
            ),
            Err(e) => debug!(
                service = %request.service_name,
                method = %request.method_name,
                request_id = %request.request_id,
                error = %e,
                "Call failed"
            ),
        }
        result
    }

    async fn attempt(
        &self,
        request: &RpcRequest,
        options: &CallOptions,
        failed: &Mutex<HashSet<String>>,
        ctx: RetryContext,
    ) -> Result<RpcResponse, RpcError> {
        if let Some(instance) = ctx.last_error.as_ref().and_then(|e| e.instance()) {
            debug!(attempt = ctx.attempt, instance, "Retrying");
            if self.exclude_failed_on_retry {
                failed.lock().insert(instance.to_string());
            }
        }

        debug!(stage = %Stage::Resolve, service = %request.service_name, attempt = ctx.attempt);
        let instances = self.resolve(&request.service_name).await?;

        debug!(stage = %Stage::Select, candidates = instances.len());
        let instance = self.select(request, options, &instances, failed)?;

        let addr = instance.address();
        debug!(stage = %Stage::Send, instance = %addr);
        self.send(request, options, &addr).await
    }

    async fn resolve(&self, service_name: &str) -> Result<Vec<ServiceMetadata>, RpcError> {
        match self.registry.discover(service_name).await {
            Ok(instances) if !instances.is_empty() => {
                self.track_membership(service_name, &instances).await;
                Ok(instances)
            }
            Ok(_) | Err(RegistryError::NotFound(_)) => Err(RpcError::NoProviderAvailable {
                service: service_name.to_string(),
            }),
            Err(source) => Err(RpcError::Registry {
                stage: Stage::Resolve,
                source,
            }),
        }
    }

    /// Watches `service_name` once, forgetting instances as they leave.
    async fn track_membership(&self, service_name: &str, instances: &[ServiceMetadata]) {
        if !self.tracked.lock().insert(service_name.to_string()) {
            return;
        }

        let known = Mutex::new(instances.iter().map(|m| m.address()).collect::<HashSet<_>>());
        let transport = self.transport.clone();
        let on_change: WatchCallback = Arc::new(move |members: &[ServiceMetadata]| {
            let current: HashSet<String> = members.iter().map(|m| m.address()).collect();
            let mut known = known.lock();
            for addr in known.difference(&current) {
                debug!(addr = %addr, "Instance left the registry");
                transport.forget(addr);
            }
            *known = current;
        });

        if let Err(e) = self.registry.watch(service_name, on_change).await {
            warn!(service = service_name, error = %e, "Failed to watch service membership");
            self.tracked.lock().remove(service_name);
        }
    }

    fn select(
        &self,
        request: &RpcRequest,
        options: &CallOptions,
        instances: &[ServiceMetadata],
        failed: &Mutex<HashSet<String>>,
    ) -> Result<ServiceMetadata, RpcError> {
        let key = options.affinity_key.as_deref().unwrap_or(&request.request_id);
        let failed = failed.lock();
        Ok(self
            .load_balancer
            .select_excluding(&request.service_name, instances, key, &failed)?)
    }

    async fn send(&self, request: &RpcRequest, options: &CallOptions, addr: &str) -> Result<RpcResponse, RpcError> {
        let payload = self.codec.encode_request(request).map_err(|e| RpcError::Codec {
            stage: Stage::Send,
            message: e.to_string(),
        })?;

        let timeout = match options.deadline {
            Some(deadline) => self
                .call_timeout
                .min(deadline.saturating_duration_since(Instant::now())),
            None => self.call_timeout,
        };

        let reply = self.transport.send(addr, &payload, timeout).await?;
        let response = Codec::decode_response(&reply).map_err(|e| RpcError::from_transport(Stage::Send, addr, e))?;

        if response.request_id != request.request_id {
            return Err(RpcError::Codec {
                stage: Stage::Send,
                message: format!(
                    "reply from {} is for request {} (expected {})",
                    addr, response.request_id, request.request_id
                ),
            });
        }

        if let Some(exception) = response.exception {
            return Err(RpcError::Application(exception));
        }

        Ok(response)
    }
}
