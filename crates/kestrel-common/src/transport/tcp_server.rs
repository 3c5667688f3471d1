use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use crate::protocol::{ErrorInfo, ErrorInfoKind, RpcRequest, RpcResponse, TransportError};
use crate::transport::codec::Codec;
use crate::transport::tcp::{send_message, try_receive_message};

/// Async TCP server for Kestrel providers.
///
/// Accepts connections in a loop and spawns one task per connection. Each
/// connection processes requests sequentially (keep-alive) until the peer
/// closes it. Replies are encoded with the codec the request arrived in.
///
/// Frames that cannot be decoded are answered with a `BadRequest` exception
/// and the connection stays open.
pub struct TcpServer {
    listener: TcpListener,
}

impl TcpServer {
    /// Creates a new TCP server bound to the specified address
    /// (e.g. `"0.0.0.0:8080"`).
    pub async fn new(bind_addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| TransportError::from_io(e, &format!("binding {}", bind_addr), 0))?;

        Ok(Self { listener })
    }

    /// Wraps an already bound listener.
    pub fn from_listener(listener: TcpListener) -> Self {
        Self { listener }
    }

    /// Gets the actual bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener
            .local_addr()
            .map_err(|e| TransportError::from_io(e, "reading local address", 0))
    }

    /// Runs the server forever with the given request handler.
    pub async fn run_with_handler<F, Fut>(&self, handler: F) -> Result<(), TransportError>
    where
        F: Fn(RpcRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResponse> + Send + 'static,
    {
        self.run_until(handler, std::future::pending()).await
    }

    /// Runs the server until `shutdown` completes.
    ///
    /// Stops accepting new connections once `shutdown` resolves. Connections
    /// already being served finish on their own tasks.
    pub async fn run_until<F, Fut, S>(&self, handler: F, shutdown: S) -> Result<(), TransportError>
    where
        F: Fn(RpcRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResponse> + Send + 'static,
        S: Future<Output = ()>,
    {
        let handler = Arc::new(handler);
        tokio::pin!(shutdown);

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested, no longer accepting connections");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        // Accept errors (e.g. too many open files) are usually transient
                        tracing::warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };

            tracing::debug!(peer = %peer_addr, "Connection established");

            let handler = handler.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, handler).await {
                    tracing::debug!(peer = %peer_addr, error = %e, "Connection error");
                }
            });
        }
    }
}

/// Handle a single TCP connection.
///
/// Processes multiple requests until the connection is closed.
async fn handle_connection<F, Fut>(mut stream: TcpStream, handler: Arc<F>) -> Result<(), TransportError>
where
    F: Fn(RpcRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResponse> + Send + 'static,
{
    let _ = stream.set_nodelay(true);

    loop {
        let frame = match try_receive_message(&mut stream).await? {
            Some(frame) => frame,
            None => {
                tracing::trace!("Connection closed by peer");
                return Ok(());
            }
        };

        // Fall back to JSON when the tag itself is unreadable
        let codec = Codec::detect(&frame).unwrap_or_default();

        let response = match Codec::decode_request(&frame) {
            Ok(request) => handler(request).await,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to decode request");
                RpcResponse::failure(
                    "",
                    ErrorInfo::new(ErrorInfoKind::BadRequest, format!("undecodable request: {}", e)),
                )
            }
        };

        let encoded = codec.encode_response(&response)?;
        send_message(&mut stream, &encoded).await?;
    }
}
