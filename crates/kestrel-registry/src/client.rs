use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use kestrel_common::config::{RegistryConfig, RegistryKind};
use kestrel_common::protocol::{RegistryError, ServiceMetadata};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{
    CoordinationBackend, EtcdBackend, KeyValue, MemoryBackend, SessionId, Subscription, WatchSink,
    ZookeeperBackend,
};

/// Called with the full membership of a service whenever it changes.
pub type WatchCallback = Arc<dyn Fn(&[ServiceMetadata]) + Send + Sync>;

/// Service registration and discovery.
///
/// Implemented by [`RegistryClient`]; the invoker and provider only ever see
/// an `Arc<dyn Registry>`, so tests can substitute their own.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Publishes an instance under this process's session.
    async fn register(&self, metadata: &ServiceMetadata) -> Result<(), RegistryError>;

    /// Removes an instance and stops renewing it.
    async fn deregister(&self, metadata: &ServiceMetadata) -> Result<(), RegistryError>;

    /// Live instances of `service_name`, ordered by registry key.
    ///
    /// Fails with `NotFound` when no instance is registered.
    async fn discover(&self, service_name: &str) -> Result<Vec<ServiceMetadata>, RegistryError>;

    /// Subscribes `on_change` to membership changes of `service_name`.
    async fn watch(&self, service_name: &str, on_change: WatchCallback) -> Result<(), RegistryError>;

    /// Renews the session and re-publishes registered instances.
    async fn heartbeat(&self) -> Result<(), RegistryError>;
}

/// Registry client with a local cache kept current by watches.
///
/// The first `discover` for a service subscribes a watch and fetches the
/// instance list; later calls are answered from the cache without network
/// I/O. Backends that push changes update the cache synchronously; the others
/// are polled every `watch_interval`. A failed poll keeps the last known
/// membership.
///
/// Cloning is cheap and every clone shares the same session and cache.
///
/// # Example
///
/// ```no_run
/// use kestrel_common::config::RegistryConfig;
/// use kestrel_common::protocol::ServiceMetadata;
/// use kestrel_registry::{Registry, RegistryClient};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let registry = RegistryClient::connect(&RegistryConfig::default()).await?;
/// registry.register(&ServiceMetadata::new("UserService", "10.0.0.5", 8080)).await?;
/// let _heartbeat = registry.spawn_heartbeat();
///
/// let instances = registry.discover("UserService").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RegistryClient {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn CoordinationBackend>,
    config: RegistryConfig,
    session: Mutex<SessionId>,
    /// Instances this process registered, by registry key
    registered: Mutex<BTreeMap<String, ServiceMetadata>>,
    cache: RwLock<HashMap<String, Arc<[ServiceMetadata]>>>,
    watched: Mutex<HashSet<String>>,
    listeners: RwLock<HashMap<String, Vec<WatchCallback>>>,
    pollers: Mutex<Vec<JoinHandle<()>>>,
}

impl RegistryClient {
    /// Connects to the backend named by `config.kind` and opens a session.
    ///
    /// Fails with `Unavailable` when the backend cannot be reached.
    pub async fn connect(config: &RegistryConfig) -> Result<Self, RegistryError> {
        let backend: Arc<dyn CoordinationBackend> = match config.kind {
            RegistryKind::Memory => Arc::new(MemoryBackend::new()),
            RegistryKind::Etcd => Arc::new(EtcdBackend::new(&config.address, config.timeout())),
            RegistryKind::Zookeeper => Arc::new(ZookeeperBackend::new(&config.address, config.timeout())),
        };
        Self::with_backend(backend, config.clone()).await
    }

    /// Builds a client over an existing backend and opens a session.
    pub async fn with_backend(
        backend: Arc<dyn CoordinationBackend>,
        config: RegistryConfig,
    ) -> Result<Self, RegistryError> {
        let session = backend.open_session(config.session_ttl()).await?;
        info!(backend = backend.name(), session, "Registry session opened");

        Ok(Self {
            inner: Arc::new(Inner {
                backend,
                config,
                session: Mutex::new(session),
                registered: Mutex::new(BTreeMap::new()),
                cache: RwLock::new(HashMap::new()),
                watched: Mutex::new(HashSet::new()),
                listeners: RwLock::new(HashMap::new()),
                pollers: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn session(&self) -> SessionId {
        *self.inner.session.lock()
    }

    /// Cached instances of `service_name`, if a watch is populating it.
    pub fn cached(&self, service_name: &str) -> Option<Arc<[ServiceMetadata]>> {
        self.inner.cache.read().get(service_name).cloned()
    }

    /// Starts the heartbeat task.
    ///
    /// Calls [`Registry::heartbeat`] every `heartbeat_interval` until the
    /// returned handle is aborted or the client is dropped.
    pub fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.heartbeat_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let client = RegistryClient { inner };
                if let Err(e) = client.heartbeat().await {
                    warn!(error = %e, "Registry heartbeat failed");
                }
            }
        })
    }

    /// Deregisters everything this process registered and closes the session.
    pub async fn shutdown(&self) -> Result<(), RegistryError> {
        let registered: Vec<ServiceMetadata> = std::mem::take(&mut *self.inner.registered.lock())
            .into_values()
            .collect();

        for metadata in &registered {
            if let Err(e) = self.inner.backend.delete(&metadata.registry_key()).await {
                warn!(key = %metadata.registry_key(), error = %e, "Failed to deregister instance");
            }
        }

        for poller in self.inner.pollers.lock().drain(..) {
            poller.abort();
        }

        let session = self.session();
        self.inner.backend.close_session(session).await?;
        info!(session, instances = registered.len(), "Registry session closed");
        Ok(())
    }

    async fn reopen_session(&self) -> Result<SessionId, RegistryError> {
        let session = self
            .inner
            .backend
            .open_session(self.inner.config.session_ttl())
            .await?;
        *self.inner.session.lock() = session;
        info!(session, "Registry session re-established");
        Ok(session)
    }

    async fn publish(&self, metadata: &ServiceMetadata) -> Result<(), RegistryError> {
        let value = serde_json::to_vec(metadata).map_err(|e| RegistryError::Codec(e.to_string()))?;
        let key = metadata.registry_key();

        match self.inner.backend.create(self.session(), &key, &value).await {
            Err(RegistryError::NotFound(_)) => {
                let session = self.reopen_session().await?;
                self.inner.backend.create(session, &key, &value).await
            }
            other => other,
        }
    }

    /// Subscribes a watch for `service_name` unless one already exists.
    async fn ensure_watch(&self, service_name: &str) -> Result<(), RegistryError> {
        if !self.inner.watched.lock().insert(service_name.to_string()) {
            return Ok(());
        }

        let prefix = ServiceMetadata::service_prefix(service_name);
        let weak = Arc::downgrade(&self.inner);
        let service = service_name.to_string();
        let sink: WatchSink = Arc::new(move |entries: Vec<KeyValue>| {
            if let Some(inner) = weak.upgrade() {
                inner.apply(&service, decode_entries(&entries));
            }
        });

        match self.inner.backend.subscribe(&prefix, sink).await {
            Ok(Subscription::Push) => {
                debug!(service = service_name, "Watching service (push)");
                Ok(())
            }
            Ok(Subscription::Poll) => {
                debug!(service = service_name, "Watching service (poll)");
                let handle = spawn_poller(Arc::downgrade(&self.inner), service_name.to_string(), prefix);
                self.inner.pollers.lock().push(handle);
                Ok(())
            }
            Err(e) => {
                self.inner.watched.lock().remove(service_name);
                Err(e)
            }
        }
    }
}

impl Inner {
    /// Replaces the cached membership and notifies listeners if it changed.
    fn apply(&self, service_name: &str, members: Vec<ServiceMetadata>) {
        {
            let mut cache = self.cache.write();
            if let Some(current) = cache.get(service_name) {
                if current.as_ref() == members.as_slice() {
                    return;
                }
            }
            cache.insert(service_name.to_string(), Arc::from(members.clone()));
        }

        info!(service = service_name, instances = members.len(), "Service membership changed");

        let listeners = self.listeners.read().get(service_name).cloned().unwrap_or_default();
        for listener in listeners {
            listener(&members);
        }
    }
}

fn spawn_poller(weak: Weak<Inner>, service_name: String, prefix: String) -> JoinHandle<()> {
    let period = match weak.upgrade() {
        Some(inner) => inner.config.watch_interval(),
        None => return tokio::spawn(async {}),
    };

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let Some(inner) = weak.upgrade() else { break };
            match inner.backend.list(&prefix).await {
                Ok(entries) => inner.apply(&service_name, decode_entries(&entries)),
                Err(e) => {
                    warn!(service = %service_name, error = %e, "Registry poll failed, serving cached instances");
                }
            }
        }
    })
}

fn decode_entries(entries: &[KeyValue]) -> Vec<ServiceMetadata> {
    entries
        .iter()
        .filter_map(|kv| match serde_json::from_slice::<ServiceMetadata>(&kv.value) {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                warn!(key = %kv.key, error = %e, "Skipping malformed registry entry");
                None
            }
        })
        .collect()
}

#[async_trait]
impl Registry for RegistryClient {
    async fn register(&self, metadata: &ServiceMetadata) -> Result<(), RegistryError> {
        self.publish(metadata).await?;
        self.inner
            .registered
            .lock()
            .insert(metadata.registry_key(), metadata.clone());
        info!(service = %metadata.service_name, address = %metadata.address(), "Registered instance");
        Ok(())
    }

    async fn deregister(&self, metadata: &ServiceMetadata) -> Result<(), RegistryError> {
        let key = metadata.registry_key();
        self.inner.registered.lock().remove(&key);
        self.inner.backend.delete(&key).await?;
        info!(service = %metadata.service_name, address = %metadata.address(), "Deregistered instance");
        Ok(())
    }

    async fn discover(&self, service_name: &str) -> Result<Vec<ServiceMetadata>, RegistryError> {
        if let Some(cached) = self.cached(service_name) {
            return non_empty(service_name, &cached);
        }

        // Subscribe before fetching so no change between the two is missed
        self.ensure_watch(service_name).await?;

        let prefix = ServiceMetadata::service_prefix(service_name);
        let fetched = decode_entries(&self.inner.backend.list(&prefix).await?);

        let snapshot = {
            let mut cache = self.inner.cache.write();
            // A watch update that landed first is at least as fresh
            cache
                .entry(service_name.to_string())
                .or_insert_with(|| Arc::from(fetched))
                .clone()
        };
        non_empty(service_name, &snapshot)
    }

    async fn watch(&self, service_name: &str, on_change: WatchCallback) -> Result<(), RegistryError> {
        self.inner
            .listeners
            .write()
            .entry(service_name.to_string())
            .or_default()
            .push(on_change);
        self.ensure_watch(service_name).await
    }

    async fn heartbeat(&self) -> Result<(), RegistryError> {
        match self.inner.backend.keep_alive(self.session()).await {
            Ok(()) => {}
            Err(RegistryError::NotFound(_)) => {
                warn!("Registry session expired, re-registering instances");
                self.reopen_session().await?;
            }
            Err(e) => return Err(e),
        }

        let registered: Vec<ServiceMetadata> = self.inner.registered.lock().values().cloned().collect();
        let mut first_error = None;
        for metadata in &registered {
            if let Err(e) = self.publish(metadata).await {
                warn!(key = %metadata.registry_key(), error = %e, "Failed to re-publish instance");
                first_error.get_or_insert(e);
            }
        }
        debug!(instances = registered.len(), "Registry heartbeat");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn non_empty(service_name: &str, instances: &[ServiceMetadata]) -> Result<Vec<ServiceMetadata>, RegistryError> {
    if instances.is_empty() {
        Err(RegistryError::NotFound(service_name.to_string()))
    } else {
        Ok(instances.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn config() -> RegistryConfig {
        RegistryConfig {
            session_ttl_secs: 30,
            heartbeat_interval_secs: 10,
            ..RegistryConfig::memory()
        }
    }

    async fn pair() -> (Arc<MemoryBackend>, RegistryClient, RegistryClient) {
        let backend = Arc::new(MemoryBackend::new());
        let provider = RegistryClient::with_backend(backend.clone(), config()).await.unwrap();
        let consumer = RegistryClient::with_backend(backend.clone(), config()).await.unwrap();
        (backend, provider, consumer)
    }

    #[tokio::test]
    async fn test_register_then_discover() {
        let (_, provider, consumer) = pair().await;
        provider
            .register(&ServiceMetadata::new("UserService", "10.0.0.2", 9000))
            .await
            .unwrap();
        provider
            .register(&ServiceMetadata::new("UserService", "10.0.0.1", 9000))
            .await
            .unwrap();

        let instances = consumer.discover("UserService").await.unwrap();
        let addresses: Vec<String> = instances.iter().map(|m| m.address()).collect();
        assert_eq!(addresses, vec!["10.0.0.1:9000", "10.0.0.2:9000"]);
    }

    #[tokio::test]
    async fn test_discover_unknown_service_is_not_found() {
        let (_, _, consumer) = pair().await;
        let err = consumer.discover("Nope").await.unwrap_err();
        assert_eq!(err, RegistryError::NotFound("Nope".to_string()));
    }

    #[tokio::test]
    async fn test_cache_follows_registrations() {
        let (_, provider, consumer) = pair().await;
        let a = ServiceMetadata::new("UserService", "a", 1);
        let b = ServiceMetadata::new("UserService", "b", 1);

        provider.register(&a).await.unwrap();
        assert_eq!(consumer.discover("UserService").await.unwrap(), vec![a.clone()]);

        provider.register(&b).await.unwrap();
        assert_eq!(consumer.discover("UserService").await.unwrap(), vec![a.clone(), b.clone()]);

        provider.deregister(&a).await.unwrap();
        assert_eq!(consumer.discover("UserService").await.unwrap(), vec![b.clone()]);

        provider.deregister(&b).await.unwrap();
        assert!(matches!(consumer.discover("UserService").await, Err(RegistryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_cached_discover_survives_backend_outage() {
        let (backend, provider, consumer) = pair().await;
        provider.register(&ServiceMetadata::new("S", "h", 1)).await.unwrap();
        consumer.discover("S").await.unwrap();

        backend.set_available(false);
        assert_eq!(consumer.discover("S").await.unwrap().len(), 1);
        assert!(matches!(consumer.discover("Other").await, Err(RegistryError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_watch_receives_full_membership() {
        let (_, provider, consumer) = pair().await;
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let seen = sizes.clone();
        consumer
            .watch("S", Arc::new(move |members: &[ServiceMetadata]| seen.lock().push(members.len())))
            .await
            .unwrap();

        provider.register(&ServiceMetadata::new("S", "a", 1)).await.unwrap();
        provider.register(&ServiceMetadata::new("S", "b", 1)).await.unwrap();
        provider.deregister(&ServiceMetadata::new("S", "a", 1)).await.unwrap();

        assert_eq!(*sizes.lock(), vec![1, 2, 1]);
    }

    #[tokio::test]
    async fn test_register_conflict_across_sessions() {
        let (_, provider, consumer) = pair().await;
        let meta = ServiceMetadata::new("S", "h", 1);
        provider.register(&meta).await.unwrap();
        // Re-registering from the owning session is fine
        provider.register(&meta.clone().with_weight(5)).await.unwrap();

        let err = consumer.register(&meta).await.unwrap_err();
        assert_eq!(err, RegistryError::Conflict(meta.registry_key()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_session_disappears_and_heartbeat_restores() {
        let (backend, provider, consumer) = pair().await;
        let meta = ServiceMetadata::new("S", "h", 1);
        provider.register(&meta).await.unwrap();
        assert_eq!(consumer.discover("S").await.unwrap().len(), 1);

        // Only the consumer keeps its session alive
        tokio::time::advance(Duration::from_secs(20)).await;
        consumer.heartbeat().await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        backend.reap_expired();
        assert!(matches!(consumer.discover("S").await, Err(RegistryError::NotFound(_))));

        let old_session = provider.session();
        provider.heartbeat().await.unwrap();
        assert_ne!(provider.session(), old_session);
        assert_eq!(consumer.discover("S").await.unwrap(), vec![meta]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_republishes_past_a_failed_instance() {
        let (backend, provider, consumer) = pair().await;
        let a = ServiceMetadata::new("S", "a", 1);
        let b = ServiceMetadata::new("S", "b", 1);
        provider.register(&a).await.unwrap();
        provider.register(&b).await.unwrap();
        consumer.discover("S").await.unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        backend.reap_expired();

        // Another process takes over `a` while the provider's session is gone
        let rival = RegistryClient::with_backend(backend.clone(), config()).await.unwrap();
        rival.register(&a).await.unwrap();

        let err = provider.heartbeat().await.unwrap_err();
        assert_eq!(err, RegistryError::Conflict(a.registry_key()));
        assert_eq!(consumer.discover("S").await.unwrap(), vec![a, b]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cache_converges_under_concurrent_changes() {
        let backend = Arc::new(MemoryBackend::new());
        let consumer = RegistryClient::with_backend(backend.clone(), config()).await.unwrap();
        assert!(consumer.discover("S").await.is_err());

        let mut providers = Vec::new();
        for port in 0..16u16 {
            let client = RegistryClient::with_backend(backend.clone(), config()).await.unwrap();
            providers.push((client, ServiceMetadata::new("S", "10.0.0.1", 9000 + port)));
        }

        for round in 0..100usize {
            let tasks: Vec<_> = providers
                .iter()
                .enumerate()
                .map(|(i, (client, meta))| {
                    let client = client.clone();
                    let meta = meta.clone();
                    tokio::spawn(async move {
                        if (i + round) % 3 == 0 {
                            client.deregister(&meta).await.unwrap();
                        } else {
                            client.register(&meta).await.unwrap();
                        }
                    })
                })
                .collect();
            for task in tasks {
                task.await.unwrap();
            }

            let stored = decode_entries(&backend.list(&ServiceMetadata::service_prefix("S")).await.unwrap());
            let cached = consumer.cached("S").unwrap();
            assert_eq!(cached.as_ref(), stored.as_slice(), "stale cache after round {}", round);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_heartbeat_keeps_instance_alive() {
        let (backend, provider, consumer) = pair().await;
        provider.register(&ServiceMetadata::new("S", "h", 1)).await.unwrap();
        let provider_heartbeat = provider.spawn_heartbeat();
        let consumer_heartbeat = consumer.spawn_heartbeat();

        // Well past the 30s TTL; the 10s heartbeat renews both sessions
        tokio::time::sleep(Duration::from_secs(95)).await;
        backend.reap_expired();
        assert_eq!(consumer.discover("S").await.unwrap().len(), 1);

        provider_heartbeat.abort();
        consumer_heartbeat.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_heartbeat_interval_keeps_running() {
        let backend = Arc::new(MemoryBackend::new());
        let config = RegistryConfig {
            heartbeat_interval_secs: 0,
            ..config()
        };
        let client = RegistryClient::with_backend(backend, config).await.unwrap();

        let heartbeat = client.spawn_heartbeat();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!heartbeat.is_finished());
        heartbeat.abort();
    }

    #[tokio::test]
    async fn test_shutdown_deregisters_everything() {
        let (_, provider, consumer) = pair().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        provider.register(&ServiceMetadata::new("S", "a", 1)).await.unwrap();
        provider.register(&ServiceMetadata::new("S", "b", 1)).await.unwrap();
        consumer
            .watch("S", Arc::new(move |_: &[ServiceMetadata]| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();

        provider.shutdown().await.unwrap();

        assert!(matches!(consumer.discover("S").await, Err(RegistryError::NotFound(_))));
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_connect_memory_and_unavailable_backend() {
        assert!(RegistryClient::connect(&RegistryConfig::memory()).await.is_ok());

        let backend = Arc::new(MemoryBackend::new());
        backend.set_available(false);
        let result = RegistryClient::with_backend(backend, config()).await;
        assert!(matches!(result, Err(RegistryError::Unavailable(_))));
    }
}
