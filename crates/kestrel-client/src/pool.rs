use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kestrel_common::config::PoolConfig;
use kestrel_common::protocol::{RpcError, Stage};
use kestrel_common::transport::TcpTransportAsync;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// A connection checked out of the pool.
///
/// Holds one of its address's permits until it is released or dropped.
/// Dropping it without calling [`ConnectionPool::release`] closes the socket.
pub struct PooledConnection {
    pub stream: TcpStream,
    pub addr: String,
    /// Whether the connection was reused from the idle list
    pub reused: bool,
    host: Arc<HostPool>,
    _permit: OwnedSemaphorePermit,
}

struct HostPool {
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<TcpStream>>,
}

/// Connection pool for TCP connections.
///
/// The pool manages connections to multiple addresses, allowing reuse of TCP
/// connections across calls.
///
/// # Architecture
///
/// - Connections are grouped by target address
/// - Each address allows at most `max_connections` checked-out connections
/// - LIFO (last-in-first-out) reuse of idle connections
/// - Connections that saw an error are dropped instead of released
///
/// When every permit for an address is taken, `acquire` waits up to
/// `acquire_timeout_ms` (or the caller's shorter bound) and then fails with
/// [`RpcError::PoolExhausted`].
///
/// Removing an address drops its idle connections; connections still checked
/// out are closed when they are released.
///
/// # Example
///
/// ```rust,no_run
/// use kestrel_client::ConnectionPool;
/// use kestrel_common::config::PoolConfig;
/// use kestrel_common::transport::TcpTransportAsync;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = ConnectionPool::new(PoolConfig::default());
/// let transport = TcpTransportAsync::new(Duration::from_secs(5));
///
/// let conn = pool.acquire("127.0.0.1:8080", &transport, Duration::from_secs(5)).await?;
/// // Use conn.stream...
/// pool.release(conn);
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool {
    config: PoolConfig,
    hosts: Mutex<HashMap<String, Arc<HostPool>>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn host(&self, addr: &str) -> Arc<HostPool> {
        self.hosts
            .lock()
            .entry(addr.to_string())
            .or_insert_with(|| {
                Arc::new(HostPool {
                    permits: Arc::new(Semaphore::new(self.config.max_connections.max(1))),
                    idle: Mutex::new(Vec::new()),
                })
            })
            .clone()
    }

    /// Acquires a connection to `addr`, reusing an idle one when available.
    ///
    /// Waits for a free permit at most `max_wait` or the configured acquire
    /// timeout, whichever is shorter.
    ///
    /// # Errors
    ///
    /// - [`RpcError::PoolExhausted`] when no permit frees up in time
    /// - A transport error when a new connection cannot be established
    pub async fn acquire(
        &self,
        addr: &str,
        transport: &TcpTransportAsync,
        max_wait: Duration,
    ) -> Result<PooledConnection, RpcError> {
        let host = self.host(addr);
        let started = Instant::now();
        let wait = Duration::from_millis(self.config.acquire_timeout_ms).min(max_wait);

        let permit = match tokio::time::timeout(wait, host.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            // The semaphore is never closed; treat it like a timeout anyway
            Ok(Err(_)) | Err(_) => {
                return Err(RpcError::PoolExhausted {
                    instance: addr.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                })
            }
        };

        // LIFO: the most recently used connection is the most likely to be alive
        let idle = host.idle.lock().pop();
        if let Some(stream) = idle {
            tracing::trace!(addr, "Reusing pooled connection");
            return Ok(PooledConnection {
                stream,
                addr: addr.to_string(),
                reused: true,
                host,
                _permit: permit,
            });
        }

        let stream = transport
            .connect(addr)
            .await
            .map_err(|e| RpcError::from_transport(Stage::Send, addr, e))?;
        tracing::debug!(addr, "Opened new connection");

        Ok(PooledConnection {
            stream,
            addr: addr.to_string(),
            reused: false,
            host,
            _permit: permit,
        })
    }

    /// Returns a healthy connection to the idle list.
    pub fn release(&self, conn: PooledConnection) {
        let PooledConnection {
            stream,
            host,
            _permit: permit,
            ..
        } = conn;
        // An address removed meanwhile keeps no idle list; the stream closes with `host`
        host.idle.lock().push(stream);
        // Only free the permit once the stream is back in the idle list
        drop(permit);
    }

    /// Number of idle connections held for `addr`.
    pub fn idle_count(&self, addr: &str) -> usize {
        self.hosts
            .lock()
            .get(addr)
            .map(|host| host.idle.lock().len())
            .unwrap_or(0)
    }

    /// Drops every idle connection to `addr`, keeping its permits.
    pub fn evict(&self, addr: &str) {
        if let Some(host) = self.hosts.lock().get(addr) {
            host.idle.lock().clear();
        }
    }

    /// Forgets `addr` entirely, e.g. after it left the registry.
    pub fn remove(&self, addr: &str) {
        if let Some(host) = self.hosts.lock().remove(addr) {
            let closed = std::mem::take(&mut *host.idle.lock()).len();
            tracing::debug!(addr, closed, "Removed connection pool");
        }
    }

    /// Number of addresses the pool currently tracks.
    pub fn host_count(&self) -> usize {
        self.hosts.lock().len()
    }
}
