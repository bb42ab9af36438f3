//! Retry helper for producers that do network I/O
//!
//! The coordinator never retries on its own; producers wrap their backend
//! call in [`RetryPolicy::run`] to get bounded attempts, a per-attempt
//! deadline and a fixed pause between attempts.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::SyncConfig;
use crate::error::SyncError;

/// Bounded retry with a per-attempt timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Pause between attempts
    pub backoff: Duration,
    /// Deadline for a single attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl RetryPolicy {
    /// Policy from engine configuration
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            attempts: config.retry_attempts.max(1),
            backoff: config.retry_backoff(),
            attempt_timeout: config.attempt_timeout(),
        }
    }

    /// Policy that tries exactly once
    pub fn none() -> Self {
        Self {
            attempts: 1,
            ..Self::default()
        }
    }

    /// Run `op` until it succeeds or the attempts are used up
    ///
    /// # Arguments
    /// * `label` - Operation name for logs and timeout errors
    /// * `op` - Builds a fresh attempt each time it is called
    ///
    /// # Returns
    /// * `Ok(T)` - First successful attempt
    /// * `Err(E)` - Error of the last attempt; an elapsed deadline becomes `SyncError::Timeout`
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        E: From<SyncError> + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;

        loop {
            let result = match tokio::time::timeout(self.attempt_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(E::from(SyncError::Timeout {
                    operation: label.to_string(),
                    after: self.attempt_timeout,
                })),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts => {
                    warn!(
                        operation = label,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Retrying operation"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy() -> RetryPolicy {
        RetryPolicy::from_config(&SyncConfig::for_test())
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<&str, SyncError> = policy()
            .run("load orders", move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(SyncError::fetch("orders", "connection reset"))
                    } else {
                        Ok("rows")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "rows");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), SyncError> = policy()
            .run("load orders", move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(SyncError::fetch("orders", "down"))
                }
            })
            .await;

        assert!(matches!(result, Err(SyncError::Fetch { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempt_times_out() {
        let result: Result<(), SyncError> = RetryPolicy::none()
            .run("load orders", || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;

        match result {
            Err(SyncError::Timeout { operation, after }) => {
                assert_eq!(operation, "load orders");
                assert_eq!(after, Duration::from_millis(5_000));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let config = SyncConfig {
            retry_attempts: 0,
            ..SyncConfig::default()
        };
        assert_eq!(RetryPolicy::from_config(&config).attempts, 1);
    }
}
