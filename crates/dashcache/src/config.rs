//! Engine configuration
//!
//! Recognized options mirror the dashboard settings file: two TTL tiers, the
//! store capacity, the coalescing wait tick and the producer retry budget.
//! Values can be overridden from `DASH_*` environment variables.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, SyncError};

/// Configuration for the client-side cache engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// TTL for ordinary datasets
    pub ttl_normal_ms: u64,
    /// TTL for datasets marked critical (reference data)
    pub ttl_critical_ms: u64,
    /// Store size that triggers eviction
    pub max_cache_entries: usize,
    /// Extra entries evicted below the cap to avoid evict/re-add thrashing
    pub eviction_margin: usize,
    /// How often coalesced callers re-inspect the store while waiting
    pub poll_interval_ms: u64,
    /// Producer attempts before giving up
    pub retry_attempts: u32,
    /// Pause between producer attempts
    pub retry_backoff_ms: u64,
    /// Deadline for a single producer attempt
    pub attempt_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ttl_normal_ms: 30_000,
            ttl_critical_ms: 600_000,
            max_cache_entries: 100,
            eviction_margin: 10,
            poll_interval_ms: 50,
            retry_attempts: 3,
            retry_backoff_ms: 400,
            attempt_timeout_ms: 5_000,
        }
    }
}

impl SyncConfig {
    /// Configuration with short timings for tests
    pub fn for_test() -> Self {
        Self {
            ttl_normal_ms: 1_000,
            ttl_critical_ms: 10_000,
            max_cache_entries: 16,
            eviction_margin: 0,
            poll_interval_ms: 5,
            retry_attempts: 3,
            retry_backoff_ms: 10,
            attempt_timeout_ms: 200,
        }
    }

    /// Apply `DASH_*` environment variable overrides
    pub fn with_env_overrides(mut self) -> Self {
        override_from_env("DASH_TTL_NORMAL_MS", &mut self.ttl_normal_ms);
        override_from_env("DASH_TTL_CRITICAL_MS", &mut self.ttl_critical_ms);
        override_from_env("DASH_MAX_CACHE_ENTRIES", &mut self.max_cache_entries);
        override_from_env("DASH_EVICTION_MARGIN", &mut self.eviction_margin);
        override_from_env("DASH_POLL_INTERVAL_MS", &mut self.poll_interval_ms);
        override_from_env("DASH_RETRY_ATTEMPTS", &mut self.retry_attempts);
        override_from_env("DASH_RETRY_BACKOFF_MS", &mut self.retry_backoff_ms);
        override_from_env("DASH_ATTEMPT_TIMEOUT_MS", &mut self.attempt_timeout_ms);
        self
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_cache_entries == 0 {
            return Err(SyncError::Config("max_cache_entries must be > 0".to_string()));
        }
        if self.eviction_margin >= self.max_cache_entries {
            return Err(SyncError::Config(format!(
                "eviction_margin ({}) must be smaller than max_cache_entries ({})",
                self.eviction_margin, self.max_cache_entries
            )));
        }
        if self.ttl_critical_ms < self.ttl_normal_ms {
            return Err(SyncError::Config(
                "ttl_critical_ms must not be shorter than ttl_normal_ms".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(SyncError::Config("poll_interval_ms must be > 0".to_string()));
        }
        if self.retry_attempts == 0 {
            return Err(SyncError::Config("retry_attempts must be > 0".to_string()));
        }
        Ok(())
    }

    /// Store settings derived from this configuration
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            ttl_normal: Duration::from_millis(self.ttl_normal_ms),
            ttl_critical: Duration::from_millis(self.ttl_critical_ms),
            max_entries: self.max_cache_entries,
            eviction_margin: self.eviction_margin,
        }
    }

    /// Coalescing wait tick
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Pause between producer attempts
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Deadline for one producer attempt
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

/// Freshness and capacity settings of a [`CacheStore`](crate::CacheStore)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// TTL for ordinary entries
    pub ttl_normal: Duration,
    /// TTL for critical entries
    pub ttl_critical: Duration,
    /// Size that triggers eviction
    pub max_entries: usize,
    /// Hysteresis below `max_entries` once eviction runs
    pub eviction_margin: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        SyncConfig::default().store_config()
    }
}

/// Replace `slot` with the parsed value of `var`, if it is set
///
/// Unparsable values are logged and ignored.
pub fn override_from_env<T: std::str::FromStr + std::fmt::Display>(var: &str, slot: &mut T) {
    if let Ok(raw) = env::var(var) {
        match raw.parse() {
            Ok(value) => {
                *slot = value;
                info!("{} override: {}", var, slot);
            }
            Err(_) => info!("ignoring unparsable {}={}", var, raw),
        }
    }
}
