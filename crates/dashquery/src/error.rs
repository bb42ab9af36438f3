//! Error types for dashquery

use std::time::Duration;

use dashcache::SyncError;
use thiserror::Error;

/// Result type alias for dashquery operations
pub type Result<T> = std::result::Result<T, QueryError>;

/// Error types for pooled, cached queries
#[derive(Debug, Error)]
pub enum QueryError {
    /// No connection freed up within the acquire timeout
    #[error("no connection available after {waited:?}")]
    PoolTimeout {
        /// How long the caller waited
        waited: Duration,
    },

    /// Pool was shut down
    #[error("connection pool is closed")]
    PoolClosed,

    /// Backing store rejected the operation
    #[error("backend error: {0}")]
    Backend(String),

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Cache layer error
    #[error(transparent)]
    Cache(#[from] SyncError),
}

impl QueryError {
    /// Build a backend error from any displayable failure
    pub fn backend(reason: impl std::fmt::Display) -> Self {
        QueryError::Backend(reason.to_string())
    }
}

impl From<QueryError> for SyncError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::Cache(inner) => inner,
            QueryError::Config(msg) => SyncError::Config(msg),
            other => SyncError::fetch("query", other),
        }
    }
}
