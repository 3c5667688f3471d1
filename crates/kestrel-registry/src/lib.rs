//! Kestrel Service Registry
//!
//! Registers provider instances and discovers the live instance set of a
//! service for callers.
//!
//! # Architecture
//!
//! - **[`RegistryClient`]**: the [`Registry`] implementation. Owns the session,
//!   the discovery cache, the watches that keep it current, and the heartbeat.
//! - **[`CoordinationBackend`]**: the store underneath. Keys live under a
//!   session and disappear when it expires, so a crashed instance drops out
//!   within one session TTL.
//!
//! # Backends
//!
//! | kind | transport | change delivery |
//! |---|---|---|
//! | `memory` | in-process | synchronous push |
//! | `etcd` | v3 JSON gateway over HTTP | polling |
//! | `zookeeper` | native protocol over TCP | polling |
//!
//! Instances are stored under `/services/{service}/{host}:{port}` as JSON
//! encoded [`ServiceMetadata`](kestrel_common::protocol::ServiceMetadata).

pub mod backend;
pub mod client;

pub use backend::{
    CoordinationBackend, EtcdBackend, KeyValue, MemoryBackend, SessionId, Subscription, WatchSink,
    ZookeeperBackend,
};
pub use client::{Registry, RegistryClient, WatchCallback};
