//! Coordination backends.
//!
//! A backend is the raw key/value store with session semantics underneath
//! the registry client: keys written under a session disappear when the
//! session expires or is closed. The registry client owns all the service
//! level logic (metadata encoding, caching, heartbeat); backends only move
//! bytes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kestrel_common::protocol::RegistryError;

mod etcd;
mod memory;
mod zookeeper;

pub use etcd::EtcdBackend;
pub use memory::MemoryBackend;
pub use zookeeper::ZookeeperBackend;

/// Backend session (etcd lease ID, ZooKeeper session ID).
pub type SessionId = i64;

/// One stored key and its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Receives the full set of entries under a watched prefix, sorted by key.
pub type WatchSink = Arc<dyn Fn(Vec<KeyValue>) + Send + Sync>;

/// How a backend delivers changes for a subscribed prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    /// The backend calls the sink itself, synchronously with each change.
    Push,
    /// The backend cannot notify; the caller has to poll `list`.
    Poll,
}

#[async_trait]
pub trait CoordinationBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Opens a session whose keys expire `ttl` after the last renewal.
    async fn open_session(&self, ttl: Duration) -> Result<SessionId, RegistryError>;

    /// Renews a session. Fails with `NotFound` once the session has expired.
    async fn keep_alive(&self, session: SessionId) -> Result<(), RegistryError>;

    /// Closes a session, removing every key it owns.
    async fn close_session(&self, session: SessionId) -> Result<(), RegistryError>;

    /// Creates `key` bound to `session`.
    ///
    /// Overwrites the value when the key already belongs to `session`; fails
    /// with `Conflict` when it belongs to another one.
    async fn create(&self, session: SessionId, key: &str, value: &[u8]) -> Result<(), RegistryError>;

    /// Deletes `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), RegistryError>;

    /// Lists entries whose key starts with `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>, RegistryError>;

    /// Subscribes `sink` to changes under `prefix`.
    async fn subscribe(&self, prefix: &str, sink: WatchSink) -> Result<Subscription, RegistryError>;
}
