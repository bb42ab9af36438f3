//! # dashcache
//!
//! Client-side cache and reconciliation engine for dashboard datasets.
//!
//! ## Architecture
//! - **Store**: Type-erased entries with two TTL tiers and oldest-first eviction
//! - **Coordinator**: At most one producer in flight per key; joiners share its result
//! - **Reconciler**: Id-keyed diff of a list, persisted add/update/remove calls
//! - **Realtime**: Insert/update/delete events merged into cached lists
//! - **Dataset**: Named list bundling source, persistence and realtime merge
//! - **Engine**: Owns one store and coordinator per session

#![warn(missing_docs)]

pub mod config;
pub mod coordinator;
pub mod dataset;
pub mod engine;
pub mod entity;
pub mod error;
pub mod key;
pub mod realtime;
pub mod reconcile;
pub mod retry;
mod stats;
pub mod store;

#[cfg(test)]
mod testing;

pub use config::{StoreConfig, SyncConfig};
pub use coordinator::{FetchCoordinator, FetchOptions};
pub use dataset::{Dataset, DatasetSource, FailurePolicy};
pub use engine::SyncEngine;
pub use entity::Entity;
pub use error::{PersistOp, Result, SyncError};
pub use key::CacheKey;
pub use realtime::{ChangeEvent, ChangeKind, InsertPosition, MergeOutcome};
pub use reconcile::{Changes, DiffPlan, NoPersistence, PersistenceOps, ReconcileReport};
pub use retry::RetryPolicy;
pub use stats::CacheStats;
pub use store::{CacheEntry, CacheStore, EntryState};
