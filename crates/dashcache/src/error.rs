//! Error types for dashcache

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for dashcache operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Persistence operation issued by the reconciler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersistOp {
    /// Entity created in the backing store
    Add,
    /// Field-level patch of an existing entity
    Update,
    /// Entity deleted from the backing store
    Remove,
}

impl fmt::Display for PersistOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistOp::Add => write!(f, "add"),
            PersistOp::Update => write!(f, "update"),
            PersistOp::Remove => write!(f, "remove"),
        }
    }
}

/// Error types for cache, reconciliation and merge operations
#[derive(Debug, Error)]
pub enum SyncError {
    /// Producer failed while fetching a dataset or query result
    #[error("fetch failed for {key}: {reason}")]
    Fetch {
        /// Cache key (or operation label) being fetched
        key: String,
        /// Producer error message
        reason: String,
    },

    /// The in-flight fetch this caller joined has failed; retry independently
    #[error("joined fetch for {key} failed: {reason}")]
    CoalescedFetchFailed {
        /// Cache key that was being fetched
        key: String,
        /// Error reported by the fetch owner
        reason: String,
    },

    /// A single persistence callback failed
    #[error("{op} failed in dataset {dataset}: {reason}")]
    Persistence {
        /// Dataset name
        dataset: String,
        /// Operation that failed
        op: PersistOp,
        /// Backing-store error message
        reason: String,
    },

    /// One or more persistence callbacks failed and the edit was rolled back
    #[error("{failed} persistence operation(s) failed in dataset {dataset}")]
    ReconcileFailed {
        /// Dataset name
        dataset: String,
        /// Number of failed callbacks
        failed: usize,
    },

    /// A realtime event could not be applied to the cached dataset
    #[error("cannot merge event into {dataset}: {reason}")]
    Merge {
        /// Dataset name
        dataset: String,
        /// Why the event was rejected
        reason: String,
    },

    /// Cache key could not be derived
    #[error("invalid cache key: {0}")]
    InvalidKey(String),

    /// Cached value was read back with a different type than it was stored with
    #[error("cached value for {key} has a different type")]
    TypeMismatch {
        /// Offending cache key
        key: String,
    },

    /// Operation exceeded its deadline
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Operation label
        operation: String,
        /// Deadline that elapsed
        after: Duration,
    },

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    Config(String),

    /// JSON conversion error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Build a fetch error from any displayable producer failure
    pub fn fetch(key: impl Into<String>, reason: impl fmt::Display) -> Self {
        SyncError::Fetch {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Build a persistence error for a dataset operation
    pub fn persistence(dataset: impl Into<String>, op: PersistOp, reason: impl fmt::Display) -> Self {
        SyncError::Persistence {
            dataset: dataset.into(),
            op,
            reason: reason.to_string(),
        }
    }

    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Fetch { .. }
                | SyncError::CoalescedFetchFailed { .. }
                | SyncError::Persistence { .. }
                | SyncError::Timeout { .. }
        )
    }
}
