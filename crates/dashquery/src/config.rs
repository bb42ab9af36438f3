//! Query service configuration

use std::time::Duration;

use dashcache::config::override_from_env;
use dashcache::StoreConfig;
use serde::{Deserialize, Serialize};

use crate::error::{QueryError, Result};

/// Configuration for the pooled query cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Number of backing-store connections
    pub pool_capacity: usize,
    /// Longest wait for a free connection
    pub acquire_timeout_ms: u64,
    /// TTL of query results without an explicit TTL
    pub default_ttl_ms: u64,
    /// Cached results that trigger eviction
    pub max_cache_entries: usize,
    /// Extra results evicted below the cap
    pub eviction_margin: usize,
    /// How often coalesced readers re-inspect the cache
    pub poll_interval_ms: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 10,
            acquire_timeout_ms: 5_000,
            default_ttl_ms: 30_000,
            max_cache_entries: 1_000,
            eviction_margin: 50,
            poll_interval_ms: 50,
        }
    }
}

impl QueryConfig {
    /// Small pool and short timings for tests
    pub fn for_test() -> Self {
        Self {
            pool_capacity: 2,
            acquire_timeout_ms: 100,
            default_ttl_ms: 1_000,
            max_cache_entries: 32,
            eviction_margin: 0,
            poll_interval_ms: 5,
        }
    }

    /// Apply `DASH_*` environment variable overrides
    pub fn with_env_overrides(mut self) -> Self {
        override_from_env("DASH_POOL_CAPACITY", &mut self.pool_capacity);
        override_from_env("DASH_ACQUIRE_TIMEOUT_MS", &mut self.acquire_timeout_ms);
        override_from_env("DASH_QUERY_TTL_MS", &mut self.default_ttl_ms);
        override_from_env("DASH_QUERY_MAX_ENTRIES", &mut self.max_cache_entries);
        override_from_env("DASH_QUERY_EVICTION_MARGIN", &mut self.eviction_margin);
        override_from_env("DASH_QUERY_POLL_INTERVAL_MS", &mut self.poll_interval_ms);
        self
    }

    /// Reject values the service cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.pool_capacity == 0 {
            return Err(QueryError::Config("pool_capacity must be > 0".to_string()));
        }
        if self.acquire_timeout_ms == 0 {
            return Err(QueryError::Config("acquire_timeout_ms must be > 0".to_string()));
        }
        if self.max_cache_entries == 0 {
            return Err(QueryError::Config("max_cache_entries must be > 0".to_string()));
        }
        if self.eviction_margin >= self.max_cache_entries {
            return Err(QueryError::Config(format!(
                "eviction_margin ({}) must be smaller than max_cache_entries ({})",
                self.eviction_margin, self.max_cache_entries
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(QueryError::Config("poll_interval_ms must be > 0".to_string()));
        }
        Ok(())
    }

    /// Longest wait for a free connection
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Coalescing wait tick
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Store settings for the query result cache; both tiers use the default TTL
    pub fn store_config(&self) -> StoreConfig {
        let ttl = Duration::from_millis(self.default_ttl_ms);
        StoreConfig {
            ttl_normal: ttl,
            ttl_critical: ttl,
            max_entries: self.max_cache_entries,
            eviction_margin: self.eviction_margin,
        }
    }
}
