//! Tag-invalidated query cache
//!
//! Query results are cached under `(operation, params)` keys with the same
//! dedup and TTL handling as the client engine. Each key is registered under
//! one or more tags (resource families such as `"orders"`); a write to that
//! family invalidates every key under the tag at once. Keys evicted from the
//! result store are dropped from the tag index as well.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;
use dashcache::{CacheKey, CacheStats, CacheStore, FetchCoordinator, FetchOptions};
use parking_lot::Mutex;
use tracing::debug;

use crate::config::QueryConfig;
use crate::error::Result;

/// Per-query options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// TTL override for this result
    pub ttl: Option<Duration>,
    /// Resource families the result depends on
    pub tags: Vec<String>,
}

impl QueryOptions {
    /// Options with no TTL override and no tags
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache the result for `ttl`
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Depend on `tag`
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

type TagIndex = HashMap<String, HashSet<CacheKey, RandomState>, RandomState>;

/// Server-side query result cache with tag invalidation
pub struct TaggedQueryCache {
    coordinator: FetchCoordinator,
    tags: Mutex<TagIndex>,
}

impl TaggedQueryCache {
    /// Create an empty cache
    pub fn new(config: &QueryConfig) -> Self {
        let store = Arc::new(CacheStore::new(config.store_config()).with_removal_log());
        Self {
            coordinator: FetchCoordinator::new(store, config.poll_interval()),
            tags: Mutex::new(HashMap::default()),
        }
    }

    /// Cached result for `key`, running `producer` on miss, expiry or invalidation
    ///
    /// The fetch owner registers `key` under every tag in `options` before
    /// `producer` runs, so an invalidation that lands mid-fetch is not lost.
    ///
    /// # Arguments
    /// * `key` - Result key, see [`CacheKey::new`]
    /// * `options` - TTL override and tags
    /// * `producer` - Runs the query; only invoked by the fetch owner
    pub async fn query<V, F, Fut>(
        &self,
        key: &CacheKey,
        options: &QueryOptions,
        producer: F,
    ) -> Result<V>
    where
        V: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let mut fetch = FetchOptions::new();
        if let Some(ttl) = options.ttl {
            fetch = fetch.ttl(ttl);
        }
        let result = self
            .coordinator
            .with_cache(key, fetch, || {
                // The slot is loading by now, so pruning cannot drop this registration
                self.register(key, &options.tags);
                producer()
            })
            .await;

        self.prune_removed();
        result
    }

    /// Forget keys the store has dropped since the last call
    fn prune_removed(&self) {
        let removed = self.coordinator.store().drain_removed();
        if removed.is_empty() {
            return;
        }

        let store = self.coordinator.store();
        let mut index = self.tags.lock();
        for key in &removed {
            // Fetched again since it was dropped
            if store.contains(key) {
                continue;
            }
            for keys in index.values_mut() {
                keys.remove(key);
            }
        }
        index.retain(|_, keys| !keys.is_empty());
    }

    fn register(&self, key: &CacheKey, tags: &[String]) {
        if tags.is_empty() {
            return;
        }
        let mut index = self.tags.lock();
        for tag in tags {
            index.entry(tag.clone()).or_default().insert(key.clone());
        }
    }

    /// Mark every key under `tags` stale and forget the registrations
    ///
    /// # Returns
    /// Number of cached entries invalidated
    pub fn invalidate_tags<S: AsRef<str>>(&self, tags: &[S]) -> usize {
        let keys: HashSet<CacheKey, RandomState> = {
            let mut index = self.tags.lock();
            tags.iter()
                .filter_map(|tag| index.remove(tag.as_ref()))
                .flatten()
                .collect()
        };

        let invalidated = keys
            .iter()
            .filter(|key| self.coordinator.invalidate(key))
            .count();
        debug!(
            tags = ?tags.iter().map(AsRef::as_ref).collect::<Vec<_>>(),
            keys = keys.len(),
            invalidated,
            "invalidated tags"
        );
        invalidated
    }

    /// Keys currently registered under `tag`
    pub fn tagged_keys(&self, tag: &str) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self
            .tags
            .lock()
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Result cache counters
    pub fn stats(&self) -> &CacheStats {
        self.coordinator.store().stats()
    }

    /// Number of cached results
    pub fn len(&self) -> usize {
        self.coordinator.store().len()
    }

    /// Whether no results are cached
    pub fn is_empty(&self) -> bool {
        self.coordinator.store().is_empty()
    }

    /// Drop every cached result and tag registration
    pub fn clear(&self) {
        self.tags.lock().clear();
        self.coordinator.clear();
        self.coordinator.store().drain_removed();
    }
}
