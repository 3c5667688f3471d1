use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kestrel_common::config::RpcConfig;
use kestrel_common::protocol::{ServiceMetadata, TransportError};
use kestrel_registry::Registry;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::dispatcher::Dispatcher;
use crate::server::{bind, shutdown_signal, RpcServer, ServerError};

/// A server that announces itself.
///
/// On start every service in the dispatcher is registered under the bound
/// address, a heartbeat keeps the registrations alive, and on shutdown the
/// registrations are removed before returning.
pub struct Provider {
    server: RpcServer,
    registry: Arc<dyn Registry>,
    host: String,
    port: u16,
    version: String,
    heartbeat_interval: Duration,
}

impl Provider {
    pub fn new(dispatcher: Dispatcher, registry: Arc<dyn Registry>, config: &RpcConfig) -> Self {
        Self {
            server: RpcServer::new(dispatcher),
            registry,
            host: config.server_host.clone(),
            port: config.server_port,
            version: config.version.clone(),
            heartbeat_interval: config.registry.heartbeat_interval(),
        }
    }

    pub fn server(&self) -> &RpcServer {
        &self.server
    }

    /// Metadata published for each service when serving on `port`.
    pub fn instances(&self, port: u16) -> Vec<ServiceMetadata> {
        self.server
            .dispatcher()
            .services()
            .into_iter()
            .map(|service| ServiceMetadata::new(service, self.host.clone(), port).with_version(self.version.clone()))
            .collect()
    }

    /// Binds the configured host and port and serves until ctrl-c.
    pub async fn start(&self) -> Result<(), ServerError> {
        let listener = bind(&format!("{}:{}", self.host, self.port)).await?;
        self.serve_with_shutdown(listener, shutdown_signal()).await
    }

    pub async fn serve_with_shutdown<S>(&self, listener: TcpListener, shutdown: S) -> Result<(), ServerError>
    where
        S: Future<Output = ()>,
    {
        let port = listener
            .local_addr()
            .map_err(|e| TransportError::from_io(e, "reading local address", 0))?
            .port();

        let instances = self.instances(port);
        for instance in &instances {
            self.registry.register(instance).await?;
            tracing::info!(service = %instance.service_name, addr = %instance.address(), "Service registered");
        }

        let heartbeat = self.spawn_heartbeat();
        let result = self.server.serve_with_shutdown(listener, shutdown).await;
        heartbeat.abort();

        for instance in &instances {
            match self.registry.deregister(instance).await {
                Ok(()) => tracing::info!(service = %instance.service_name, "Service deregistered"),
                Err(e) => tracing::warn!(service = %instance.service_name, error = %e, "Failed to deregister"),
            }
        }

        result
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let period = self.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = registry.heartbeat().await {
                    tracing::warn!(error = %e, "Heartbeat failed");
                }
            }
        })
    }
}
