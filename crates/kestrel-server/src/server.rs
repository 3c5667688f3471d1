use std::future::Future;
use std::sync::Arc;

use kestrel_common::protocol::{RegistryError, TransportError};
use kestrel_common::transport::TcpServer;
use thiserror::Error;
use tokio::net::TcpListener;

use crate::dispatcher::Dispatcher;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: TransportError },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Serves a [`Dispatcher`] over framed TCP.
///
/// Each connection gets its own task and is served request by request until
/// the peer hangs up.
pub struct RpcServer {
    dispatcher: Arc<Dispatcher>,
}

impl RpcServer {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Binds `0.0.0.0:port` and serves until ctrl-c.
    pub async fn start(&self, port: u16) -> Result<(), ServerError> {
        let listener = bind(&format!("0.0.0.0:{}", port)).await?;
        self.serve_with_shutdown(listener, shutdown_signal()).await
    }

    /// Serves on `listener` until `shutdown` completes.
    pub async fn serve_with_shutdown<S>(&self, listener: TcpListener, shutdown: S) -> Result<(), ServerError>
    where
        S: Future<Output = ()>,
    {
        let server = TcpServer::from_listener(listener);
        let local_addr = server.local_addr()?;
        tracing::info!(
            addr = %local_addr,
            services = ?self.dispatcher.services(),
            "RPC server listening"
        );

        let dispatcher = self.dispatcher.clone();
        server
            .run_until(
                move |request| {
                    let dispatcher = dispatcher.clone();
                    async move { dispatcher.dispatch(request).await }
                },
                shutdown,
            )
            .await?;

        tracing::info!(addr = %local_addr, "RPC server stopped");
        Ok(())
    }
}

pub(crate) async fn bind(addr: &str) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr).await.map_err(|e| ServerError::Bind {
        addr: addr.to_string(),
        source: TransportError::from_io(e, "bind", 0),
    })
}

/// Resolves on ctrl-c.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Cannot listen for ctrl-c, serving until killed");
        std::future::pending::<()>().await;
    }
}
