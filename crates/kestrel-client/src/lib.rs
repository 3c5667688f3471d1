//! Kestrel Client
//!
//! The caller side of a remote invocation. A call flows through
//! `Resolve -> Select -> Send`:
//!
//! - [`Invoker`] asks the registry for the service's live instances
//! - [`LoadBalancer`] picks one of them
//! - [`ClientTransport`] exchanges the encoded request over a pooled connection
//!
//! [`RetryStrategy`] wraps each attempt; [`KestrelClient`] is the typed entry
//! point most callers use.

pub mod client;
pub mod invoker;
pub mod load_balancer;
pub mod pool;
pub mod retry;
pub mod transport;

pub use client::KestrelClient;
pub use invoker::{CallOptions, Invoker};
pub use load_balancer::{hash_key, LoadBalancer, VIRTUAL_NODES};
pub use pool::{ConnectionPool, PooledConnection};
pub use retry::{BackoffSpec, RetryContext, RetryPolicy, RetryStrategy};
pub use transport::{ClientTransport, PooledTcpTransport};
