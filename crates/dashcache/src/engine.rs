//! Engine instance
//!
//! One [`SyncEngine`] per session owns the store and the coordinator. It is
//! created at startup and cleared at logout; nothing is process-global.

use std::future::Future;
use std::sync::Arc;

use tracing::info;

use crate::config::SyncConfig;
use crate::coordinator::{FetchCoordinator, FetchOptions};
use crate::dataset::{Dataset, DatasetSource};
use crate::entity::Entity;
use crate::error::{Result, SyncError};
use crate::key::CacheKey;
use crate::retry::RetryPolicy;
use crate::stats::CacheStats;
use crate::store::CacheStore;

/// Client-side cache engine
pub struct SyncEngine {
    config: SyncConfig,
    coordinator: Arc<FetchCoordinator>,
}

impl SyncEngine {
    /// Create an engine with an empty store
    ///
    /// # Errors
    /// * `Config` - `config` fails validation
    pub fn new(config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(CacheStore::new(config.store_config()));
        let coordinator = Arc::new(FetchCoordinator::new(store, config.poll_interval()));

        info!(
            ttl_normal_ms = config.ttl_normal_ms,
            ttl_critical_ms = config.ttl_critical_ms,
            max_cache_entries = config.max_cache_entries,
            "sync engine started"
        );
        Ok(Self {
            config,
            coordinator,
        })
    }

    /// Engine configuration
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Shared store
    pub fn store(&self) -> &Arc<CacheStore> {
        self.coordinator.store()
    }

    /// Shared coordinator
    pub fn coordinator(&self) -> &Arc<FetchCoordinator> {
        &self.coordinator
    }

    /// Store counters
    pub fn stats(&self) -> &CacheStats {
        self.store().stats()
    }

    /// Retry policy built from the engine configuration
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_config(&self.config)
    }

    /// See [`FetchCoordinator::with_cache`]
    pub async fn with_cache<V, E, F, Fut>(
        &self,
        key: &CacheKey,
        options: FetchOptions,
        producer: F,
    ) -> std::result::Result<V, E>
    where
        V: Clone + Send + Sync + 'static,
        E: From<SyncError> + std::fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, E>>,
    {
        self.coordinator.with_cache(key, options, producer).await
    }

    /// Dataset handle bound to this engine
    pub fn dataset<T: Entity>(
        &self,
        name: impl Into<String>,
        source: impl DatasetSource<T> + 'static,
    ) -> Result<Dataset<T>> {
        Dataset::new(name, self.coordinator.clone(), source)
    }

    /// Drop every cached entry (logout)
    pub fn clear(&self) {
        self.coordinator.clear();
        info!("sync engine cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{row, Row};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_rejects_invalid_config() {
        let config = SyncConfig {
            max_cache_entries: 0,
            ..SyncConfig::for_test()
        };
        assert!(matches!(SyncEngine::new(config), Err(SyncError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_datasets_share_store() {
        let engine = SyncEngine::new(SyncConfig::for_test()).unwrap();
        let rows = engine
            .dataset::<Row>("rows", || async { Ok::<_, SyncError>(vec![row(1, 1)]) })
            .unwrap();
        let other = engine
            .dataset::<Row>("other", || async { Ok::<_, SyncError>(vec![row(9, 9)]) })
            .unwrap();

        rows.load().await.unwrap();
        other.load().await.unwrap();

        assert_eq!(engine.store().len(), 2);
        assert_eq!(engine.stats().misses(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_forces_refetch() {
        let engine = SyncEngine::new(SyncConfig::for_test()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let rows = engine
            .dataset::<Row>("rows", move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, SyncError>(vec![row(1, 1)])
                }
            })
            .unwrap();

        rows.load().await.unwrap();
        engine.clear();
        assert!(engine.store().is_empty());

        rows.load().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_cache_passthrough() {
        let engine = SyncEngine::new(SyncConfig::for_test()).unwrap();
        let key = CacheKey::new("count", &serde_json::json!({"clinic": 4})).unwrap();

        let first: u32 = engine
            .with_cache(&key, FetchOptions::new(), || async { Ok::<_, SyncError>(7) })
            .await
            .unwrap();
        let second: u32 = engine
            .with_cache(&key, FetchOptions::new(), || async { Ok::<_, SyncError>(8) })
            .await
            .unwrap();

        assert_eq!((first, second), (7, 7));
        assert_eq!(engine.stats().hits(), 1);
    }
}
