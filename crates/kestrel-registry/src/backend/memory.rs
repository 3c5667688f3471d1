use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use kestrel_common::protocol::RegistryError;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{CoordinationBackend, KeyValue, SessionId, Subscription, WatchSink};

struct Lease {
    ttl: Duration,
    expires_at: Instant,
}

struct Record {
    value: Vec<u8>,
    session: SessionId,
}

#[derive(Default)]
struct State {
    next_session: SessionId,
    sessions: HashMap<SessionId, Lease>,
    keys: BTreeMap<String, Record>,
    watchers: Vec<(String, WatchSink)>,
}

impl State {
    fn snapshot(&self, prefix: &str) -> Vec<KeyValue> {
        self.keys
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, record)| KeyValue::new(key.clone(), record.value.clone()))
            .collect()
    }

    /// Drops expired sessions and their keys, returning the removed keys.
    fn reap(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        if expired.is_empty() {
            return Vec::new();
        }

        for id in &expired {
            self.sessions.remove(id);
        }

        let removed: Vec<String> = self
            .keys
            .iter()
            .filter(|(_, record)| expired.contains(&record.session))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &removed {
            self.keys.remove(key);
        }

        tracing::debug!(sessions = expired.len(), keys = removed.len(), "Reaped expired sessions");
        removed
    }

    /// Snapshots for every watcher affected by a change to `changed`.
    fn notifications(&self, changed: &[String]) -> Vec<(WatchSink, Vec<KeyValue>)> {
        self.watchers
            .iter()
            .filter(|(prefix, _)| changed.iter().any(|key| key.starts_with(prefix.as_str())))
            .map(|(prefix, sink)| (sink.clone(), self.snapshot(prefix)))
            .collect()
    }
}

/// In-process coordination backend.
///
/// Implements the same session semantics as the network backends (keys vanish
/// when their session expires or closes) and pushes changes to subscribers
/// synchronously, before the mutating call returns. Expiry uses tokio's clock,
/// so tests can drive it with `tokio::time::pause`/`advance`.
///
/// One `MemoryBackend` shared through an `Arc` acts as the registry for every
/// client in the process.
///
/// Sinks are called in mutation order and must not call back into the
/// backend.
pub struct MemoryBackend {
    state: Mutex<State>,
    /// Held from the end of a mutation until its sinks have run
    delivery: Mutex<()>,
    available: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_session: 1,
                ..State::default()
            }),
            delivery: Mutex::new(()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates losing (or regaining) the connection to the store.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Expires overdue sessions now instead of on the next operation.
    pub fn reap_expired(&self) {
        let _ = self.mutate(|_, _| Ok(((), Vec::new())));
    }

    fn check_available(&self) -> Result<(), RegistryError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RegistryError::Unavailable("memory registry is offline".to_string()))
        }
    }

    /// Runs `f` under the lock after reaping, then notifies watchers of every
    /// key that was reaped or reported changed by `f`.
    ///
    /// The delivery lock is taken before the state lock is released, so
    /// snapshots reach the sinks in the order they were taken.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut State, Instant) -> Result<(T, Vec<String>), RegistryError>,
    ) -> Result<T, RegistryError> {
        let now = Instant::now();
        let (result, pending, _delivery) = {
            let mut state = self.state.lock();
            let mut changed = state.reap(now);
            let result = match f(&mut state, now) {
                Ok((value, keys)) => {
                    changed.extend(keys);
                    Ok(value)
                }
                Err(e) => Err(e),
            };
            let pending = state.notifications(&changed);
            let delivery = if pending.is_empty() {
                None
            } else {
                Some(self.delivery.lock())
            };
            (result, pending, delivery)
        };

        for (sink, snapshot) in pending {
            sink(snapshot);
        }

        result
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn open_session(&self, ttl: Duration) -> Result<SessionId, RegistryError> {
        self.check_available()?;
        self.mutate(|state, now| {
            let id = state.next_session;
            state.next_session += 1;
            state.sessions.insert(
                id,
                Lease {
                    ttl,
                    expires_at: now + ttl,
                },
            );
            Ok((id, Vec::new()))
        })
    }

    async fn keep_alive(&self, session: SessionId) -> Result<(), RegistryError> {
        self.check_available()?;
        self.mutate(|state, now| match state.sessions.get_mut(&session) {
            Some(lease) => {
                lease.expires_at = now + lease.ttl;
                Ok(((), Vec::new()))
            }
            None => Err(RegistryError::NotFound(format!("session {}", session))),
        })
    }

    async fn close_session(&self, session: SessionId) -> Result<(), RegistryError> {
        self.check_available()?;
        self.mutate(|state, _| {
            state.sessions.remove(&session);
            let owned: Vec<String> = state
                .keys
                .iter()
                .filter(|(_, record)| record.session == session)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &owned {
                state.keys.remove(key);
            }
            Ok(((), owned))
        })
    }

    async fn create(&self, session: SessionId, key: &str, value: &[u8]) -> Result<(), RegistryError> {
        self.check_available()?;
        self.mutate(|state, _| {
            if !state.sessions.contains_key(&session) {
                return Err(RegistryError::NotFound(format!("session {}", session)));
            }
            if let Some(existing) = state.keys.get(key) {
                if existing.session != session {
                    return Err(RegistryError::Conflict(key.to_string()));
                }
            }
            state.keys.insert(
                key.to_string(),
                Record {
                    value: value.to_vec(),
                    session,
                },
            );
            Ok(((), vec![key.to_string()]))
        })
    }

    async fn delete(&self, key: &str) -> Result<(), RegistryError> {
        self.check_available()?;
        self.mutate(|state, _| {
            let changed = match state.keys.remove(key) {
                Some(_) => vec![key.to_string()],
                None => Vec::new(),
            };
            Ok(((), changed))
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>, RegistryError> {
        self.check_available()?;
        self.mutate(|state, _| Ok((state.snapshot(prefix), Vec::new())))
    }

    async fn subscribe(&self, prefix: &str, sink: WatchSink) -> Result<Subscription, RegistryError> {
        self.check_available()?;
        self.state.lock().watchers.push((prefix.to_string(), sink));
        Ok(Subscription::Push)
    }
}
