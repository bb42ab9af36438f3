//! Fetch coordinator
//!
//! Wraps a producer with a freshness check, request coalescing and forced
//! refresh. For any key at most one producer runs at a time: later callers
//! join the in-flight fetch through a per-key `watch` channel and read the
//! settled entry once it completes.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::key::CacheKey;
use crate::store::CacheStore;

/// Per-call fetch options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Skip the freshness check and invoke the producer
    pub force_refresh: bool,
    /// Use the long TTL tier
    pub critical: bool,
    /// TTL for the stored result, overriding both tiers
    pub ttl: Option<Duration>,
}

impl FetchOptions {
    /// Default options: normal tier, no forced refresh
    pub fn new() -> Self {
        Self::default()
    }

    /// Set forced refresh
    pub fn force_refresh(mut self, force: bool) -> Self {
        self.force_refresh = force;
        self
    }

    /// Mark the dataset critical
    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    /// Set an explicit TTL
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

#[derive(Debug, Clone)]
enum FetchState {
    Pending,
    Done,
    Failed(String),
}

enum Claim<V> {
    Hit(V),
    Lead(watch::Sender<FetchState>, u64),
    Join(watch::Receiver<FetchState>),
}

enum JoinOutcome {
    Ready,
    Failed(String),
    Abandoned,
}

/// Coordinates producer invocations against a [`CacheStore`]
pub struct FetchCoordinator {
    store: Arc<CacheStore>,
    inflight: Mutex<HashMap<CacheKey, watch::Receiver<FetchState>, RandomState>>,
    poll_interval: Duration,
}

impl FetchCoordinator {
    /// Create a coordinator over `store`
    ///
    /// # Arguments
    /// * `store` - Shared cache store
    /// * `poll_interval` - How often joined callers re-inspect the store
    pub fn new(store: Arc<CacheStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            inflight: Mutex::new(HashMap::with_hasher(RandomState::new())),
            poll_interval,
        }
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Whether a producer is currently running for `key`
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.inflight.lock().contains_key(key)
    }

    /// Return the cached value for `key`, invoking `producer` on miss or expiry
    ///
    /// # Arguments
    /// * `key` - Cache key of the dataset or query
    /// * `options` - Forced refresh, TTL tier and TTL override
    /// * `producer` - Fetches the value; only invoked if this caller owns the fetch
    ///
    /// # Returns
    /// * `Ok(V)` - Cached or freshly produced value
    /// * `Err(E)` - Producer error (fetch owner) or `CoalescedFetchFailed` (joined caller)
    pub async fn with_cache<V, E, F, Fut>(
        &self,
        key: &CacheKey,
        options: FetchOptions,
        producer: F,
    ) -> std::result::Result<V, E>
    where
        V: Clone + Send + Sync + 'static,
        E: From<SyncError> + Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, E>>,
    {
        let (tx, load_id) = loop {
            match self.claim::<V>(key, options)? {
                Claim::Hit(data) => return Ok(data),
                Claim::Lead(tx, load_id) => break (tx, load_id),
                Claim::Join(mut rx) => {
                    self.store.stats().record_coalesced();
                    debug!(key = %key, "joining in-flight fetch");

                    match self.wait_for_owner::<V>(key, &mut rx).await {
                        JoinOutcome::Ready => {
                            if let Some(entry) = self.store.get::<V>(key)? {
                                if let (false, false, Some(data)) =
                                    (entry.is_loading, entry.is_stale, entry.data)
                                {
                                    return Ok(data);
                                }
                            }
                            // Settled entry gone, reloading, or invalidated while the
                            // owner was fetching: its result may predate a write, claim again
                        }
                        JoinOutcome::Failed(reason) => {
                            return Err(SyncError::CoalescedFetchFailed {
                                key: key.to_string(),
                                reason,
                            }
                            .into());
                        }
                        JoinOutcome::Abandoned => {
                            debug!(key = %key, "fetch owner went away, reclaiming");
                        }
                    }
                }
            }
        };

        self.store.stats().record_miss();
        debug!(key = %key, force = options.force_refresh, "invoking producer");

        let mut guard = LoadGuard {
            coordinator: self,
            key,
            load_id,
            tx: Some(tx),
        };

        match producer().await {
            Ok(data) => {
                self.store
                    .finish_load(key, load_id, data.clone(), options.ttl);
                guard.settle(FetchState::Done);
                Ok(data)
            }
            Err(err) => {
                warn!(key = %key, error = %err, "producer failed");
                self.store.stats().record_fetch_failure();
                self.store.fail_load(key, load_id);
                guard.settle(FetchState::Failed(err.to_string()));
                Err(err)
            }
        }
    }

    /// Decide, atomically with respect to other callers, how to serve `key`
    fn claim<V: Clone + 'static>(&self, key: &CacheKey, options: FetchOptions) -> Result<Claim<V>> {
        let mut inflight = self.inflight.lock();
        if let Some(rx) = inflight.get(key) {
            return Ok(Claim::Join(rx.clone()));
        }

        // Read even on forced refresh so a type clash surfaces before loading
        let entry = self.store.get::<V>(key)?;
        if let Some(entry) = entry {
            if !options.force_refresh
                && !entry.is_loading
                && !self.store.is_expired(&entry, options.critical)
            {
                if let Some(data) = entry.data {
                    self.store.stats().record_hit();
                    debug!(key = %key, "cache hit");
                    return Ok(Claim::Hit(data));
                }
            }
        }

        let (tx, rx) = watch::channel(FetchState::Pending);
        inflight.insert(key.clone(), rx);
        let load_id = self.store.begin_load(key);
        Ok(Claim::Lead(tx, load_id))
    }

    async fn wait_for_owner<V: Clone + 'static>(
        &self,
        key: &CacheKey,
        rx: &mut watch::Receiver<FetchState>,
    ) -> JoinOutcome {
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                FetchState::Done => return JoinOutcome::Ready,
                FetchState::Failed(reason) => return JoinOutcome::Failed(reason),
                FetchState::Pending => {}
            }

            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return JoinOutcome::Abandoned;
                    }
                }
                _ = tokio::time::sleep(self.poll_interval) => {
                    // A direct write may settle the entry before the owner finishes
                    if matches!(self.store.get::<V>(key), Ok(Some(entry)) if entry.is_ready()) {
                        return JoinOutcome::Ready;
                    }
                }
            }
        }
    }

    /// Mark `key` stale
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.store.invalidate(key)
    }

    /// Drop every cached entry
    pub fn clear(&self) {
        self.store.clear();
    }
}

/// Settles the in-flight record for a fetch, even if the owner is dropped
struct LoadGuard<'a> {
    coordinator: &'a FetchCoordinator,
    key: &'a CacheKey,
    load_id: u64,
    tx: Option<watch::Sender<FetchState>>,
}

impl LoadGuard<'_> {
    fn settle(&mut self, state: FetchState) {
        if let Some(tx) = self.tx.take() {
            self.coordinator.inflight.lock().remove(self.key);
            tx.send_replace(state);
        }
    }
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            warn!(key = %self.key, "fetch abandoned before completion");
            self.coordinator.store.fail_load(self.key, self.load_id);
            self.coordinator.inflight.lock().remove(self.key);
            // Dropping the sender wakes joiners, one of which takes over
            self.tx = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn coordinator() -> Arc<FetchCoordinator> {
        let store = Arc::new(CacheStore::new(StoreConfig {
            ttl_normal: Duration::from_secs(10),
            ttl_critical: Duration::from_secs(60),
            max_entries: 100,
            eviction_margin: 0,
        }));
        Arc::new(FetchCoordinator::new(store, Duration::from_millis(5)))
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::named(name).unwrap()
    }

    async fn counted(
        coordinator: &FetchCoordinator,
        calls: &AtomicUsize,
        options: FetchOptions,
        value: u32,
    ) -> Result<u32> {
        coordinator
            .with_cache(&key("orders"), options, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, SyncError>(value)
            })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_skips_producer() {
        let coordinator = coordinator();
        let calls = AtomicUsize::new(0);

        assert_eq!(counted(&coordinator, &calls, FetchOptions::new(), 1).await.unwrap(), 1);
        assert_eq!(counted(&coordinator, &calls, FetchOptions::new(), 2).await.unwrap(), 1);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.store().stats().hits(), 1);
        assert_eq!(coordinator.store().stats().misses(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_freshness() {
        let coordinator = coordinator();
        let calls = AtomicUsize::new(0);

        counted(&coordinator, &calls, FetchOptions::new(), 1).await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(counted(&coordinator, &calls, FetchOptions::new(), 2).await.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(counted(&coordinator, &calls, FetchOptions::new(), 2).await.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_tier_outlives_normal_ttl() {
        let coordinator = coordinator();
        let calls = AtomicUsize::new(0);
        let critical = FetchOptions::new().critical(true);

        counted(&coordinator, &calls, critical, 1).await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(counted(&coordinator, &calls, critical, 2).await.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_refresh() {
        let coordinator = coordinator();
        let calls = AtomicUsize::new(0);

        counted(&coordinator, &calls, FetchOptions::new(), 1).await.unwrap();
        let refreshed = counted(&coordinator, &calls, FetchOptions::new().force_refresh(true), 2)
            .await
            .unwrap();

        assert_eq!(refreshed, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_coalesce() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let coordinator = Arc::clone(&coordinator);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                coordinator
                    .with_cache(&key("orders"), FetchOptions::new(), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, SyncError>(vec![7u32, 8, 9])
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), vec![7, 8, 9]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.store().stats().coalesced(), 9);
        assert!(!coordinator.is_in_flight(&key("orders")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_first_fetch() {
        let coordinator = coordinator();

        let owner = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .with_cache(&key("orders"), FetchOptions::new(), || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err::<u32, _>(SyncError::fetch("orders", "connection reset"))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        let joiner = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .with_cache(&key("orders"), FetchOptions::new(), || async {
                        Ok::<u32, SyncError>(1)
                    })
                    .await
            })
        };

        assert!(matches!(owner.await.unwrap(), Err(SyncError::Fetch { .. })));
        assert!(matches!(
            joiner.await.unwrap(),
            Err(SyncError::CoalescedFetchFailed { .. })
        ));
        assert!(coordinator.store().get::<u32>(&key("orders")).unwrap().is_none());
        assert_eq!(coordinator.store().stats().fetch_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_keeps_previous_data() {
        let coordinator = coordinator();
        coordinator.store().set(key("orders"), 5u32);

        let result = coordinator
            .with_cache(&key("orders"), FetchOptions::new().force_refresh(true), || async {
                Err::<u32, _>(SyncError::fetch("orders", "timeout"))
            })
            .await;
        assert!(result.is_err());

        let entry = coordinator.store().get::<u32>(&key("orders")).unwrap().unwrap();
        assert!(!entry.is_loading);
        assert_eq!(entry.data, Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_owner_hands_over() {
        let coordinator = coordinator();

        let owner = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .with_cache(&key("orders"), FetchOptions::new(), || async {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok::<u32, SyncError>(1)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        let joiner = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .with_cache(&key("orders"), FetchOptions::new(), || async {
                        Ok::<u32, SyncError>(42)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        owner.abort();
        assert_eq!(joiner.await.unwrap().unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_set_releases_joiners() {
        let coordinator = coordinator();

        let owner = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .with_cache(&key("orders"), FetchOptions::new(), || async {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        Ok::<u32, SyncError>(1)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        let joiner = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .with_cache(&key("orders"), FetchOptions::new(), || async {
                        Ok::<u32, SyncError>(99)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        coordinator.store().set(key("orders"), 5u32);
        assert_eq!(joiner.await.unwrap().unwrap(), 5);

        // The owner still returns its own result, but the newer write is kept
        assert_eq!(owner.await.unwrap().unwrap(), 1);
        let entry = coordinator.store().get::<u32>(&key("orders")).unwrap().unwrap();
        assert_eq!(entry.data, Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_joiner_after_invalidation_refetches() {
        let coordinator = coordinator();

        let owner = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .with_cache(&key("orders"), FetchOptions::new(), || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<u32, SyncError>(1)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        coordinator.invalidate(&key("orders"));
        let joiner = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .with_cache(&key("orders"), FetchOptions::new(), || async {
                        Ok::<u32, SyncError>(2)
                    })
                    .await
            })
        };

        assert_eq!(owner.await.unwrap().unwrap(), 1);
        assert_eq!(joiner.await.unwrap().unwrap(), 2);
        assert_eq!(coordinator.store().stats().coalesced(), 1);
        let entry = coordinator.store().get::<u32>(&key("orders")).unwrap().unwrap();
        assert_eq!(entry.data, Some(2));
        assert!(!entry.is_stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_type_mismatch_is_fatal() {
        let coordinator = coordinator();
        coordinator.store().set(key("orders"), "text".to_string());

        let result = coordinator
            .with_cache(&key("orders"), FetchOptions::new().force_refresh(true), || async {
                Ok::<u32, SyncError>(1)
            })
            .await;
        assert!(matches!(result, Err(SyncError::TypeMismatch { .. })));
    }
}
