use std::time::Duration;

use async_trait::async_trait;
use kestrel_common::config::PoolConfig;
use kestrel_common::protocol::{RpcError, Stage, TransportError};
use kestrel_common::transport::TcpTransportAsync;
use tokio::time::Instant;

use crate::pool::{ConnectionPool, PooledConnection};

/// Moves one encoded request to an instance and returns the raw reply.
///
/// The invoker only depends on this trait, so tests can swap the network
/// for something scripted.
#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Sends `payload` to `addr` and waits at most `timeout` for the reply.
    async fn send(&self, addr: &str, payload: &[u8], timeout: Duration) -> Result<Vec<u8>, RpcError>;

    /// Drops whatever is kept for `addr` after it left the registry.
    fn forget(&self, _addr: &str) {}
}

/// [`ClientTransport`] over pooled, framed TCP connections.
///
/// A connection goes back to the pool only after a complete exchange; any
/// error drops it. A reused connection that turns out to be closed by the
/// peer is replaced by a fresh one once, since idle connections can go stale
/// without the pool noticing.
///
/// `timeout` covers the whole send: waiting for a pooled connection,
/// connecting and the exchange itself.
pub struct PooledTcpTransport {
    pool: ConnectionPool,
}

impl PooledTcpTransport {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            pool: ConnectionPool::new(config),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

#[async_trait]
impl ClientTransport for PooledTcpTransport {
    async fn send(&self, addr: &str, payload: &[u8], timeout: Duration) -> Result<Vec<u8>, RpcError> {
        let deadline = Instant::now() + timeout;

        let mut conn = self.checkout(addr, timeout, deadline).await?;
        let mut outcome = TcpTransportAsync::new(remaining(addr, timeout, deadline)?)
            .round_trip(&mut conn.stream, payload)
            .await;

        if conn.reused && matches!(outcome, Err(TransportError::Closed(_)) | Err(TransportError::Io(_))) {
            tracing::debug!(addr, "Pooled connection went stale, reconnecting");
            drop(conn);
            self.pool.evict(addr);
            conn = self.checkout(addr, timeout, deadline).await?;
            outcome = TcpTransportAsync::new(remaining(addr, timeout, deadline)?)
                .round_trip(&mut conn.stream, payload)
                .await;
        }

        match outcome {
            Ok(reply) => {
                self.pool.release(conn);
                Ok(reply)
            }
            Err(e) => Err(RpcError::from_transport(Stage::Send, addr, e)),
        }
    }

    fn forget(&self, addr: &str) {
        self.pool.remove(addr);
    }
}

impl PooledTcpTransport {
    async fn checkout(&self, addr: &str, timeout: Duration, deadline: Instant) -> Result<PooledConnection, RpcError> {
        let left = remaining(addr, timeout, deadline)?;
        self.pool.acquire(addr, &TcpTransportAsync::new(left), left).await
    }
}

/// Time left before `deadline`; a `Timeout` error once it has passed.
fn remaining(addr: &str, timeout: Duration, deadline: Instant) -> Result<Duration, RpcError> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(RpcError::from_transport(
            Stage::Send,
            addr,
            TransportError::Timeout(timeout.as_millis() as u64),
        ));
    }
    Ok(left)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::protocol::ErrorKind;
    use kestrel_common::transport::{receive_message, send_message};
    use tokio::net::TcpListener;

    /// Echoes `limit` frames per connection, then closes it.
    async fn spawn_echo(limit: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    for _ in 0..limit {
                        let Ok(frame) = receive_message(&mut stream).await else { return };
                        if send_message(&mut stream, &frame).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_send_reuses_connection() {
        let addr = spawn_echo(usize::MAX).await;
        let transport = PooledTcpTransport::new(PoolConfig::default());

        for i in 0..3u8 {
            let reply = transport.send(&addr, &[i], Duration::from_secs(1)).await.unwrap();
            assert_eq!(reply, vec![i]);
        }
        assert_eq!(transport.pool().idle_count(&addr), 1);
    }

    #[tokio::test]
    async fn test_stale_connection_is_replaced() {
        // Server closes every connection after one exchange
        let addr = spawn_echo(1).await;
        let transport = PooledTcpTransport::new(PoolConfig::default());

        assert_eq!(transport.send(&addr, b"a", Duration::from_secs(1)).await.unwrap(), b"a");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.send(&addr, b"b", Duration::from_secs(1)).await.unwrap(), b"b");
    }

    #[tokio::test]
    async fn test_pool_wait_is_bounded_by_call_timeout() {
        let addr = spawn_echo(usize::MAX).await;
        let transport = PooledTcpTransport::new(PoolConfig {
            max_connections: 1,
            acquire_timeout_ms: 2_000,
        });

        let _held = transport
            .pool()
            .acquire(&addr, &TcpTransportAsync::new(Duration::from_secs(1)), Duration::from_secs(1))
            .await
            .unwrap();

        let started = Instant::now();
        let err = transport.send(&addr, b"x", Duration::from_millis(100)).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(1), "waited {:?}", started.elapsed());
        assert!(matches!(err, RpcError::PoolExhausted { .. }), "{}", err);
    }

    #[tokio::test]
    async fn test_forget_closes_idle_connections() {
        let addr = spawn_echo(usize::MAX).await;
        let transport = PooledTcpTransport::new(PoolConfig::default());

        transport.send(&addr, b"x", Duration::from_secs(1)).await.unwrap();
        assert_eq!(transport.pool().idle_count(&addr), 1);

        transport.forget(&addr);
        assert_eq!(transport.pool().idle_count(&addr), 0);
        assert_eq!(transport.pool().host_count(), 0);
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let transport = PooledTcpTransport::new(PoolConfig::default());
        let err = transport.send(&addr, b"x", Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.instance(), Some(addr.as_str()));
        assert_eq!(transport.pool().idle_count(&addr), 0);
    }
}
