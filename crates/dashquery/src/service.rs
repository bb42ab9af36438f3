//! Pooled, cached query service
//!
//! Reads go through the tagged cache and only take a connection on a miss.
//! Writes always take a connection and invalidate their tags afterwards.

use std::future::Future;
use std::sync::Arc;

use dashcache::CacheKey;
use tracing::{debug, info, warn};

use crate::config::QueryConfig;
use crate::error::Result;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::tagged::{QueryOptions, TaggedQueryCache};

/// Connection pool plus tagged result cache
pub struct QueryService<C: Send + 'static> {
    pool: Arc<ConnectionPool<C>>,
    cache: TaggedQueryCache,
}

impl<C: Send + 'static> QueryService<C> {
    /// Open `pool_capacity` connections with `connect` and build the service
    ///
    /// # Arguments
    /// * `config` - Pool and cache settings
    /// * `connect` - Creates connection number `n`
    ///
    /// # Errors
    /// * `Config` - `config` fails validation
    pub fn new(config: &QueryConfig, connect: impl FnMut(usize) -> C) -> Result<Self> {
        config.validate()?;
        let connections = (0..config.pool_capacity).map(connect).collect();
        let pool = ConnectionPool::new(connections, config.acquire_timeout())?;
        info!(
            pool_capacity = config.pool_capacity,
            acquire_timeout_ms = config.acquire_timeout_ms,
            default_ttl_ms = config.default_ttl_ms,
            "query service started"
        );
        Ok(Self {
            pool,
            cache: TaggedQueryCache::new(config),
        })
    }

    /// Cached read; a connection is held only while `op` runs on a miss
    ///
    /// # Arguments
    /// * `key` - Result key
    /// * `options` - TTL override and tags the result depends on
    /// * `op` - Query to run on a pooled connection
    pub async fn read<V, F, Fut>(&self, key: &CacheKey, options: &QueryOptions, op: F) -> Result<V>
    where
        V: Clone + Send + Sync + 'static,
        F: FnOnce(PooledConnection<C>) -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let pool = &self.pool;
        self.cache
            .query(key, options, || async move {
                let conn = pool.acquire().await?;
                op(conn).await
            })
            .await
    }

    /// Run a mutation and invalidate `tags`, whether or not it succeeded
    ///
    /// # Arguments
    /// * `tags` - Resource families touched by the mutation
    /// * `op` - Mutation to run on a pooled connection
    pub async fn write<T, S, F, Fut>(&self, tags: &[S], op: F) -> Result<T>
    where
        S: AsRef<str>,
        F: FnOnce(PooledConnection<C>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let result = match self.pool.acquire().await {
            Ok(conn) => op(conn).await,
            Err(e) => Err(e),
        };

        let invalidated = self.cache.invalidate_tags(tags);
        match &result {
            Ok(_) => debug!(invalidated, "write committed"),
            Err(e) => warn!(invalidated, error = %e, "write failed, tags invalidated anyway"),
        }
        result
    }

    /// Connection pool
    pub fn pool(&self) -> &Arc<ConnectionPool<C>> {
        &self.pool
    }

    /// Result cache
    pub fn cache(&self) -> &TaggedQueryCache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueryError;
    use futures::future::join_all;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    type Table = Arc<Mutex<Vec<u32>>>;

    fn service(capacity: usize) -> QueryService<Table> {
        let table: Table = Arc::new(Mutex::new(vec![1, 2, 3]));
        let config = QueryConfig {
            pool_capacity: capacity,
            ..QueryConfig::for_test()
        };
        QueryService::new(&config, |_| table.clone()).unwrap()
    }

    fn count_key() -> CacheKey {
        CacheKey::new("order_count", &json!({ "clinic": 1 })).unwrap()
    }

    async fn count(service: &QueryService<Table>) -> Result<usize> {
        service
            .read(&count_key(), &QueryOptions::new().tag("orders"), |conn| async move {
                Ok(conn.lock().len())
            })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hits_take_no_connection() {
        let service = service(2);

        assert_eq!(count(&service).await.unwrap(), 3);
        assert_eq!(count(&service).await.unwrap(), 3);

        assert_eq!(service.pool().acquired(), 1);
        assert_eq!(service.cache().stats().hits(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_invalidates_tag() {
        let service = service(2);
        assert_eq!(count(&service).await.unwrap(), 3);

        service
            .write(&["orders"], |conn| async move {
                conn.lock().push(4);
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(count(&service).await.unwrap(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_still_invalidates() {
        let service = service(2);
        assert_eq!(count(&service).await.unwrap(), 3);

        let result: Result<()> = service
            .write(&["orders"], |conn| async move {
                conn.lock().push(4);
                Err(QueryError::backend("constraint violated after partial write"))
            })
            .await;

        assert!(matches!(result, Err(QueryError::Backend(_))));
        assert_eq!(count(&service).await.unwrap(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_reads_respect_pool_bound() {
        let service = Arc::new(service(2));

        let reads = (0..10u32).map(|i| {
            let service = service.clone();
            tokio::spawn(async move {
                let key = CacheKey::new("order", &json!({ "id": i })).unwrap();
                service
                    .read(&key, &QueryOptions::new(), |conn| async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Ok(conn.lock().contains(&i))
                    })
                    .await
            })
        });

        let results = join_all(reads).await;

        assert!(results.into_iter().all(|r| matches!(r, Ok(Ok(_)))));
        assert!(service.pool().peak_active() <= 2);
        assert_eq!(service.pool().acquired(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_surfaces_pool_timeout() {
        let service = service(1);
        let held = service.pool().acquire().await.unwrap();

        let err = count(&service).await.unwrap_err();

        assert!(matches!(err, QueryError::PoolTimeout { .. }));
        drop(held);
        assert_eq!(count(&service).await.unwrap(), 3);
    }
}
