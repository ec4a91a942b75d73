//! Service discovery backed by a watched key/value subtree

use crate::config::DiscoveryConfig;
use crate::endpoint::{normalize_base_path, KvPair, ServiceFilter, ServiceSet};
use crate::fanout::{Subscribers, Subscription};
use crate::metrics::DiscoveryMetrics;
use crate::watch::{load_snapshot, WatchLoop};
use crate::{DiscoveryError, Result};
use discovery_store::{new_store, Backend, StoreConfig, StoreHandle};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// The discovery surface an RPC client routes with
#[async_trait::async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// Current endpoint set
    async fn get_services(&self) -> ServiceSet;

    /// Receive every future endpoint set, best effort
    async fn subscribe(&self) -> Subscription;

    async fn unsubscribe(&self, subscription: &Subscription);

    /// Replace the filter applied to every following update
    async fn set_filter(&self, filter: ServiceFilter);

    /// Independent discovery for `service_path` below this one
    async fn clone_service(&self, service_path: &str) -> Result<Box<dyn ServiceDiscovery>>;

    /// Stop watching
    fn close(&self);
}

/// State shared between a watcher and its watch loop
pub(crate) struct Shared {
    pub(crate) base_path: String,
    // base_path + "/"
    pub(crate) prefix: String,
    pub(crate) services: RwLock<ServiceSet>,
    pub(crate) filter: RwLock<Option<ServiceFilter>>,
    pub(crate) subscribers: Subscribers,
    pub(crate) config: DiscoveryConfig,
    pub(crate) metrics: Option<DiscoveryMetrics>,
}

/// Builder for `KvDiscovery`
pub struct DiscoveryBuilder {
    base_path: String,
    config: DiscoveryConfig,
    filter: Option<ServiceFilter>,
    metrics: Option<DiscoveryMetrics>,
}

impl DiscoveryBuilder {
    pub fn new(base_path: &str) -> Self {
        Self {
            base_path: normalize_base_path(base_path),
            config: DiscoveryConfig::default(),
            filter: None,
            metrics: None,
        }
    }

    pub fn config(mut self, config: DiscoveryConfig) -> Self {
        self.config = config;
        self
    }

    /// See `DiscoveryConfig::retries_after_watch_failed`
    pub fn retries_after_watch_failed(mut self, retries: i64) -> Self {
        self.config.retries_after_watch_failed = retries;
        self
    }

    /// Filter applied to the initial snapshot and every update
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&KvPair) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn metrics(mut self, metrics: DiscoveryMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Load the initial snapshot and start watching.
    ///
    /// Fails when the base path cannot be listed. A missing base path is not
    /// an error and yields an empty endpoint set.
    pub async fn build(self, store: StoreHandle) -> Result<KvDiscovery> {
        let shared = Shared {
            prefix: format!("{}/", self.base_path),
            services: RwLock::new(crate::endpoint::empty_set()),
            filter: RwLock::new(self.filter),
            subscribers: Subscribers::new(
                &self.base_path,
                self.config.subscriber_capacity,
                self.config.send_timeout,
                self.metrics.clone(),
            ),
            base_path: self.base_path,
            config: self.config,
            metrics: self.metrics,
        };

        let services = load_snapshot(store.store().as_ref(), &shared).await?;
        info!(
            "Loaded {} services under {} from {} store",
            services.len(),
            shared.base_path,
            store.store().name()
        );
        if let Some(metrics) = &shared.metrics {
            metrics.record_update(&shared.base_path, services.len());
        }
        *shared.services.write().await = services;

        let shared = Arc::new(shared);
        let stop = CancellationToken::new();
        let watch = WatchLoop::new(shared.clone(), store.lease(), stop.clone());
        let task = tokio::spawn(watch.run());

        Ok(KvDiscovery {
            shared,
            store,
            stop,
            task: Mutex::new(Some(task)),
        })
    }
}

/// Discovery of the endpoints registered under one base path of a key/value
/// store. The endpoint set is cached locally and kept current by a background
/// watch loop; subscribers get every new set pushed to them.
///
/// Dropping the watcher stops its watch loop.
pub struct KvDiscovery {
    shared: Arc<Shared>,
    store: StoreHandle,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl KvDiscovery {
    /// Connect to the store and watch `base_path/service_path`
    pub async fn new(
        base_path: &str,
        service_path: &str,
        backend: Backend,
        addrs: &[String],
        config: &StoreConfig,
    ) -> Result<Self> {
        let path = format!(
            "{}/{}",
            normalize_base_path(base_path),
            normalize_base_path(service_path)
        );
        Self::connect(&path, backend, addrs, config).await
    }

    /// Connect to the store and watch `base_path` itself, typically as the
    /// parent of per-service clones
    pub async fn template(
        base_path: &str,
        backend: Backend,
        addrs: &[String],
        config: &StoreConfig,
    ) -> Result<Self> {
        Self::connect(base_path, backend, addrs, config).await
    }

    /// Watch `base_path` over an existing store connection
    pub async fn with_store(base_path: &str, store: StoreHandle) -> Result<Self> {
        DiscoveryBuilder::new(base_path).build(store).await
    }

    pub fn builder(base_path: &str) -> DiscoveryBuilder {
        DiscoveryBuilder::new(base_path)
    }

    async fn connect(
        path: &str,
        backend: Backend,
        addrs: &[String],
        config: &StoreConfig,
    ) -> Result<Self> {
        let store = new_store(backend, addrs, config).map_err(|e| {
            info!("Cannot create {} store: {}", backend, e);
            e
        })?;

        match Self::with_store(path, store.clone()).await {
            Ok(discovery) => Ok(discovery),
            Err(e) => {
                // Nobody else holds this connection
                store.store().close();
                Err(e)
            }
        }
    }

    /// Independent watcher for `base_path/service_path` over the same store
    /// connection. It inherits this watcher's configuration and metrics but
    /// not its filter.
    pub async fn clone_service(&self, service_path: &str) -> Result<KvDiscovery> {
        let service_path = normalize_base_path(service_path);
        if service_path.is_empty() {
            return Err(DiscoveryError::InvalidPath(service_path));
        }

        let path = format!("{}/{}", self.shared.base_path, service_path);
        let mut builder = DiscoveryBuilder::new(&path).config(self.shared.config.clone());
        if let Some(metrics) = &self.shared.metrics {
            builder = builder.metrics(metrics.clone());
        }
        builder.build(self.store.clone()).await
    }

    pub fn base_path(&self) -> &str {
        &self.shared.base_path
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.shared.config
    }

    /// Replace the filter. Applies from the next update on.
    pub async fn set_filter<F>(&self, filter: F)
    where
        F: Fn(&KvPair) -> bool + Send + Sync + 'static,
    {
        *self.shared.filter.write().await = Some(Arc::new(filter));
    }

    /// Current endpoint set
    pub async fn get_services(&self) -> ServiceSet {
        self.shared.services.read().await.clone()
    }

    /// Register a new subscriber. Once the watch loop has ended the returned
    /// subscription is already closed.
    pub async fn subscribe(&self) -> Subscription {
        self.shared.subscribers.subscribe().await
    }

    /// Remove a subscriber; a no-op for unknown subscriptions
    pub async fn unsubscribe(&self, subscription: &Subscription) {
        self.shared.subscribers.unsubscribe(subscription.id()).await;
    }

    pub async fn subscriber_count(&self) -> usize {
        self.shared.subscribers.len().await
    }

    /// Stop the watch loop. Calling it again has no effect.
    pub fn close(&self) {
        if !self.stop.is_cancelled() {
            debug!("Closing discovery for {}", self.shared.base_path);
        }
        self.stop.cancel();
    }

    /// Whether the watch loop is still running. False after `close` and after
    /// the loop gave up re-establishing its watch, in which case the endpoint
    /// set is no longer kept current.
    pub fn is_watching(&self) -> bool {
        self.task
            .lock()
            .map(|task| task.as_ref().is_some_and(|t| !t.is_finished()))
            .unwrap_or(false)
    }

    /// Wait for the watch loop to end and return how it ended. Returns `Ok`
    /// if the loop was already awaited.
    pub async fn wait(&self) -> Result<()> {
        let task = self
            .task
            .lock()
            .map_err(|e| DiscoveryError::TaskFailed(e.to_string()))?
            .take();

        match task {
            Some(task) => task
                .await
                .map_err(|e| DiscoveryError::TaskFailed(e.to_string()))?,
            None => Ok(()),
        }
    }
}

impl Drop for KvDiscovery {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl fmt::Debug for KvDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvDiscovery")
            .field("base_path", &self.shared.base_path)
            .field("store", &self.store)
            .field("closed", &self.stop.is_cancelled())
            .finish()
    }
}

#[async_trait::async_trait]
impl ServiceDiscovery for KvDiscovery {
    async fn get_services(&self) -> ServiceSet {
        KvDiscovery::get_services(self).await
    }

    async fn subscribe(&self) -> Subscription {
        KvDiscovery::subscribe(self).await
    }

    async fn unsubscribe(&self, subscription: &Subscription) {
        KvDiscovery::unsubscribe(self, subscription).await
    }

    async fn set_filter(&self, filter: ServiceFilter) {
        KvDiscovery::set_filter(self, move |pair| filter(pair)).await
    }

    async fn clone_service(&self, service_path: &str) -> Result<Box<dyn ServiceDiscovery>> {
        let discovery = KvDiscovery::clone_service(self, service_path).await?;
        Ok(Box::new(discovery))
    }

    fn close(&self) {
        KvDiscovery::close(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use discovery_store::{memory, KvEntry, KvStore, MemoryStore, StoreError, WatchStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::{timeout, Instant};

    /// Memory store whose watch and list calls can be made to fail
    #[derive(Clone)]
    struct FlakyStore {
        inner: MemoryStore,
        failing_watches: Arc<AtomicUsize>,
        watch_attempts: Arc<AtomicUsize>,
        fail_list: bool,
    }

    impl FlakyStore {
        fn new(inner: MemoryStore, failing_watches: usize) -> Self {
            Self {
                inner,
                failing_watches: Arc::new(AtomicUsize::new(failing_watches)),
                watch_attempts: Arc::new(AtomicUsize::new(0)),
                fail_list: false,
            }
        }

        fn attempts(&self) -> usize {
            self.watch_attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl KvStore for FlakyStore {
        async fn list(&self, prefix: &str) -> discovery_store::Result<Vec<KvEntry>> {
            if self.fail_list {
                return Err(StoreError::Internal("listing refused".to_string()));
            }
            self.inner.list(prefix).await
        }

        async fn watch_tree(
            &self,
            prefix: &str,
            stop: CancellationToken,
        ) -> discovery_store::Result<WatchStream> {
            self.watch_attempts.fetch_add(1, Ordering::SeqCst);
            let failing = self.failing_watches.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_watches.store(failing - 1, Ordering::SeqCst);
                return Err(StoreError::Internal("watch refused".to_string()));
            }
            self.inner.watch_tree(prefix, stop).await
        }

        fn close(&self) {
            self.inner.close();
        }
    }

    fn keys(services: &ServiceSet) -> Vec<String> {
        let mut keys: Vec<String> = services.iter().map(|p| p.key.clone()).collect();
        keys.sort();
        keys
    }

    async fn recv_until<F>(subscription: &mut Subscription, predicate: F) -> ServiceSet
    where
        F: Fn(&ServiceSet) -> bool,
    {
        timeout(Duration::from_secs(300), async {
            loop {
                let services = subscription.recv().await.expect("subscription ended");
                if predicate(&services) {
                    return services;
                }
            }
        })
        .await
        .expect("no matching batch")
    }

    fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        store.put("svc/tcp@10.0.0.1:8972", "weight=1");
        store.put("svc/tcp@10.0.0.2:8972", "weight=1&state=inactive");
        store.put("svcx/tcp@10.0.0.9:8972", "weight=1");
        store.put("other/tcp@10.0.0.8:8972", "weight=1");
        store
    }

    #[tokio::test]
    async fn test_snapshot_keeps_prefixed_and_filtered_pairs() {
        let store = seeded_store();
        let discovery = KvDiscovery::builder("svc")
            .filter(|pair| !pair.value.contains("state=inactive"))
            .build(StoreHandle::new(store))
            .await
            .unwrap();

        let services = discovery.get_services().await;
        assert_eq!(
            &services[..],
            &[KvPair::new("tcp@10.0.0.1:8972", "weight=1")]
        );
    }

    #[tokio::test]
    async fn test_base_path_normalization() {
        let store = seeded_store();
        for path in ["svc", "/svc", "svc/", "/svc/"] {
            let discovery = KvDiscovery::with_store(path, StoreHandle::new(store.clone()))
                .await
                .unwrap();
            assert_eq!(discovery.base_path(), "svc");
            assert_eq!(discovery.get_services().await.len(), 2);
        }
    }

    #[tokio::test]
    async fn test_missing_path_yields_empty_cache() {
        let discovery = KvDiscovery::with_store("nothing/here", StoreHandle::new(seeded_store()))
            .await
            .unwrap();
        assert!(discovery.get_services().await.is_empty());
        assert!(discovery.is_watching());
    }

    #[tokio::test]
    async fn test_listing_error_fails_construction() {
        let mut store = FlakyStore::new(seeded_store(), 0);
        store.fail_list = true;

        let result = KvDiscovery::with_store("svc", StoreHandle::new(store.clone())).await;
        assert!(matches!(result, Err(DiscoveryError::Store(StoreError::Internal(_)))));
        assert_eq!(store.attempts(), 0);
    }

    #[tokio::test]
    async fn test_update_replaces_cache_and_reaches_all_subscribers() {
        let store = seeded_store();
        let discovery = KvDiscovery::with_store("svc", StoreHandle::new(store.clone()))
            .await
            .unwrap();

        let mut subscriptions = Vec::new();
        for _ in 0..3 {
            subscriptions.push(discovery.subscribe().await);
        }
        assert_eq!(discovery.subscriber_count().await, 3);

        store.put("svc/tcp@10.0.0.3:8972", "weight=2");

        for subscription in subscriptions.iter_mut() {
            let services = recv_until(subscription, |s| s.len() == 3).await;
            assert_eq!(
                keys(&services),
                vec!["tcp@10.0.0.1:8972", "tcp@10.0.0.2:8972", "tcp@10.0.0.3:8972"]
            );
        }
        assert_eq!(keys(&discovery.get_services().await).len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_never_see_a_partial_update() {
        let store = MemoryStore::new();
        store.put("svc/n000", "");
        let discovery = Arc::new(
            KvDiscovery::with_store("svc", StoreHandle::new(store.clone()))
                .await
                .unwrap(),
        );
        let mut subscription = discovery.subscribe().await;
        let done = CancellationToken::new();

        let mut readers = Vec::new();
        for _ in 0..8 {
            let discovery = discovery.clone();
            let done = done.clone();
            readers.push(tokio::spawn(async move {
                let mut last = 0;
                while !done.is_cancelled() {
                    let services = discovery.get_services().await;
                    let expected: Vec<String> =
                        (0..services.len()).map(|i| format!("n{:03}", i)).collect();
                    assert_eq!(keys(&services), expected);
                    assert!(services.len() >= last);
                    last = services.len();
                    tokio::task::yield_now().await;
                }
            }));
        }

        for i in 1..50 {
            store.put(format!("svc/n{:03}", i), "");
        }
        recv_until(&mut subscription, |s| s.len() == 50).await;
        done.cancel();

        for reader in readers {
            reader.await.unwrap();
        }
        assert_eq!(discovery.get_services().await.len(), 50);
    }

    #[tokio::test]
    async fn test_subscribe_after_close_ends_immediately() {
        let discovery = KvDiscovery::with_store("svc", StoreHandle::new(seeded_store()))
            .await
            .unwrap();
        discovery.close();
        discovery.wait().await.unwrap();

        let mut late = discovery.subscribe().await;
        let ended = timeout(Duration::from_secs(5), late.recv()).await;
        assert!(matches!(ended, Ok(None)));
        assert_eq!(discovery.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_empty_subtree_clears_cache() {
        let store = seeded_store();
        let discovery = KvDiscovery::with_store("svc", StoreHandle::new(store.clone()))
            .await
            .unwrap();
        let mut subscription = discovery.subscribe().await;
        assert_eq!(discovery.get_services().await.len(), 2);

        store.delete_tree("svc/");

        recv_until(&mut subscription, |s| s.is_empty()).await;
        assert!(discovery.get_services().await.is_empty());
    }

    #[tokio::test]
    async fn test_set_filter_applies_to_next_update() {
        let store = seeded_store();
        let discovery = KvDiscovery::with_store("svc", StoreHandle::new(store.clone()))
            .await
            .unwrap();
        let mut subscription = discovery.subscribe().await;

        discovery
            .set_filter(|pair| !pair.value.contains("state=inactive"))
            .await;
        store.put("svc/tcp@10.0.0.3:8972", "weight=1");

        let services = recv_until(&mut subscription, |s| {
            s.iter().any(|p| p.key == "tcp@10.0.0.3:8972")
        })
        .await;
        assert_eq!(keys(&services), vec!["tcp@10.0.0.1:8972", "tcp@10.0.0.3:8972"]);
    }

    #[tokio::test]
    async fn test_unsubscribed_channel_stops_receiving() {
        let store = seeded_store();
        let discovery = KvDiscovery::with_store("svc", StoreHandle::new(store.clone()))
            .await
            .unwrap();
        let mut kept = discovery.subscribe().await;
        let removed = discovery.subscribe().await;

        discovery.unsubscribe(&removed).await;
        discovery.unsubscribe(&removed).await;
        assert_eq!(discovery.subscriber_count().await, 1);

        store.put("svc/tcp@10.0.0.3:8972", "weight=1");
        recv_until(&mut kept, |s| s.len() == 3).await;

        let mut receiver = removed.into_receiver();
        let mut late = Vec::new();
        while let Ok(services) = receiver.try_recv() {
            late.push(services);
        }
        assert!(late.iter().all(|s| s.len() < 3));
    }

    #[tokio::test]
    async fn test_close_stops_loop_and_releases_store_once() {
        let store = seeded_store();
        let discovery = KvDiscovery::with_store("svc", StoreHandle::new(store.clone()))
            .await
            .unwrap();
        let mut subscription = discovery.subscribe().await;

        discovery.close();
        discovery.close();
        timeout(Duration::from_secs(5), discovery.wait())
            .await
            .expect("watch loop did not stop")
            .unwrap();

        assert!(!discovery.is_watching());
        assert_eq!(store.close_count(), 1);

        let drained = timeout(Duration::from_secs(5), async {
            while subscription.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok());
        assert_eq!(discovery.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_close_with_stalled_subscriber() {
        let store = seeded_store();
        let config = DiscoveryConfig {
            subscriber_capacity: 1,
            ..Default::default()
        };
        let discovery = KvDiscovery::builder("svc")
            .config(config)
            .build(StoreHandle::new(store.clone()))
            .await
            .unwrap();
        let _stalled = discovery.subscribe().await;

        for i in 0..5 {
            store.put(format!("svc/tcp@10.0.1.{}:8972", i), "weight=1");
        }

        discovery.close();
        timeout(Duration::from_secs(5), discovery.wait())
            .await
            .expect("watch loop blocked by subscriber")
            .unwrap();
        assert_eq!(store.close_count(), 1);
    }

    #[tokio::test]
    async fn test_no_retries_gives_up_on_first_failure() {
        let store = FlakyStore::new(seeded_store(), usize::MAX);
        let discovery = KvDiscovery::builder("svc")
            .retries_after_watch_failed(0)
            .build(StoreHandle::new(store.clone()))
            .await
            .unwrap();

        let result = timeout(Duration::from_secs(5), discovery.wait())
            .await
            .expect("watch loop kept retrying");
        assert!(matches!(result, Err(DiscoveryError::WatchAbandoned { .. })));
        assert_eq!(store.attempts(), 1);
        assert!(!discovery.is_watching());
        assert_eq!(store.inner.close_count(), 1);

        // The last known endpoints stay readable
        assert_eq!(discovery.get_services().await.len(), 2);

        let mut late = discovery.subscribe().await;
        let ended = timeout(Duration::from_secs(5), late.recv()).await;
        assert!(matches!(ended, Ok(None)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_retries() {
        let store = FlakyStore::new(seeded_store(), usize::MAX);
        let discovery = KvDiscovery::builder("svc")
            .retries_after_watch_failed(3)
            .build(StoreHandle::new(store.clone()))
            .await
            .unwrap();

        let started = Instant::now();
        let result = discovery.wait().await;
        assert!(matches!(result, Err(DiscoveryError::WatchAbandoned { .. })));
        assert_eq!(store.attempts(), 4);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1 + 2 + 4));
        assert!(elapsed < Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_retries_keep_going() {
        let memory = seeded_store();
        let store = FlakyStore::new(memory.clone(), 10);
        let discovery = KvDiscovery::with_store("svc", StoreHandle::new(store.clone()))
            .await
            .unwrap();
        let mut subscription = discovery.subscribe().await;

        let started = Instant::now();
        memory.put("svc/tcp@10.0.0.3:8972", "weight=1");
        recv_until(&mut subscription, |s| s.len() == 3).await;

        assert_eq!(store.attempts(), 11);
        // 1 + 2 + 4 + 8 + 16, then capped at 30 for the remaining five
        assert!(started.elapsed() >= Duration::from_secs(31 + 150));
        assert!(discovery.is_watching());
    }

    #[tokio::test]
    async fn test_expired_watch_is_reestablished() {
        let memory = seeded_store();
        let store = FlakyStore::new(memory.clone(), 0);
        let metrics = DiscoveryMetrics::new().unwrap();
        let discovery = KvDiscovery::builder("svc")
            .metrics(metrics.clone())
            .build(StoreHandle::new(store.clone()))
            .await
            .unwrap();
        let mut subscription = discovery.subscribe().await;
        recv_until(&mut subscription, |s| s.len() == 2).await;

        memory.expire_watches();
        timeout(Duration::from_secs(5), async {
            while store.attempts() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("watch was not re-established");

        memory.put("svc/tcp@10.0.0.3:8972", "weight=1");
        recv_until(&mut subscription, |s| s.len() == 3).await;
        assert!(discovery.is_watching());
        assert_eq!(metrics.rewatches_total.with_label_values(&["svc"]).get(), 1);
        assert_eq!(memory.close_count(), 0);
    }

    #[tokio::test]
    async fn test_clone_is_independent() {
        let store = MemoryStore::new();
        store.put("svc/orders/tcp@10.0.0.1:8972", "");
        store.put("svc/users/tcp@10.0.0.2:8972", "");
        let handle = StoreHandle::new(store.clone());

        let parent = KvDiscovery::with_store("svc", handle).await.unwrap();
        let child = parent.clone_service("orders").await.unwrap();
        assert_eq!(child.base_path(), "svc/orders");
        assert_eq!(keys(&child.get_services().await), vec!["tcp@10.0.0.1:8972"]);
        assert_eq!(parent.get_services().await.len(), 2);

        let mut parent_subscription = parent.subscribe().await;
        let _child_subscription = child.subscribe().await;

        child.close();
        child.wait().await.unwrap();
        assert_eq!(store.close_count(), 0);
        assert!(parent.is_watching());
        assert_eq!(parent.subscriber_count().await, 1);

        store.put("svc/users/tcp@10.0.0.3:8972", "");
        recv_until(&mut parent_subscription, |s| s.len() == 3).await;

        parent.close();
        parent.wait().await.unwrap();
        assert_eq!(store.close_count(), 1);
    }

    #[tokio::test]
    async fn test_clone_requires_service_path() {
        let discovery = KvDiscovery::with_store("svc", StoreHandle::new(seeded_store()))
            .await
            .unwrap();
        assert!(matches!(
            discovery.clone_service("/").await,
            Err(DiscoveryError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_trait_object() {
        let store = seeded_store();
        let discovery: Box<dyn ServiceDiscovery> = Box::new(
            KvDiscovery::with_store("", StoreHandle::new(store.clone()))
                .await
                .unwrap(),
        );
        assert!(discovery.get_services().await.is_empty());

        let svc = discovery.clone_service("svc").await.unwrap();
        svc.set_filter(Arc::new(|pair: &KvPair| pair.key.ends_with(".3:8972")))
            .await;
        let mut subscription = svc.subscribe().await;

        store.put("svc/tcp@10.0.0.3:8972", "");
        let services = recv_until(&mut subscription, |s| s.len() == 1).await;
        assert_eq!(keys(&services), vec!["tcp@10.0.0.3:8972"]);

        svc.unsubscribe(&subscription).await;
        svc.close();
        discovery.close();
    }

    #[tokio::test]
    async fn test_connect_through_registry() {
        memory::register();

        let discovery = KvDiscovery::new(
            "/rpcx/",
            "Arith",
            Backend::Memory,
            &[],
            &StoreConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(discovery.base_path(), "rpcx/Arith");
        assert!(discovery.get_services().await.is_empty());

        let template = KvDiscovery::template("/rpcx", Backend::Memory, &[], &StoreConfig::default())
            .await
            .unwrap();
        assert_eq!(template.base_path(), "rpcx");
    }
}
