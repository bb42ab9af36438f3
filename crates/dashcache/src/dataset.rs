//! Named datasets
//!
//! A [`Dataset`] ties one cache key to the source that produces it, the
//! persistence callbacks that write it back and the realtime merger that
//! keeps it current between fetches.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::coordinator::{FetchCoordinator, FetchOptions};
use crate::entity::Entity;
use crate::error::{Result, SyncError};
use crate::key::CacheKey;
use crate::realtime::{merge_event, ChangeEvent, InsertPosition, MergeOutcome};
use crate::reconcile::{self, NoPersistence, PersistenceOps, ReconcileReport};

/// Produces the full contents of a dataset
#[async_trait]
pub trait DatasetSource<T: Entity>: Send + Sync {
    /// Fetch every entity of the dataset, in display order
    async fn fetch(&self) -> Result<Vec<T>>;
}

#[async_trait]
impl<T, F, Fut> DatasetSource<T> for F
where
    T: Entity,
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<T>>> + Send,
{
    async fn fetch(&self) -> Result<Vec<T>> {
        (self)().await
    }
}

/// What to do with an optimistic edit when persistence partly fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Keep the edit in the cache and report the failures
    #[default]
    KeepOptimistic,
    /// Restore the pre-edit contents and fail the mutation
    Rollback,
}

/// Handle to a cached, persisted and realtime-synced list of entities
pub struct Dataset<T: Entity> {
    name: String,
    key: CacheKey,
    coordinator: Arc<FetchCoordinator>,
    source: Arc<dyn DatasetSource<T>>,
    ops: Arc<dyn PersistenceOps<T>>,
    critical: bool,
    position: InsertPosition,
}

impl<T: Entity> Dataset<T> {
    /// Create a dataset cached under `CacheKey::named(name)`
    ///
    /// # Errors
    /// * `InvalidKey` - `name` is empty or contains `:`
    pub fn new(
        name: impl Into<String>,
        coordinator: Arc<FetchCoordinator>,
        source: impl DatasetSource<T> + 'static,
    ) -> Result<Self> {
        let name = name.into();
        let key = CacheKey::named(&name)?;
        Ok(Self {
            name,
            key,
            coordinator,
            source: Arc::new(source),
            ops: Arc::new(NoPersistence),
            critical: false,
            position: InsertPosition::default(),
        })
    }

    /// Cache under an explicit key, e.g. one built from query parameters
    pub fn with_key(mut self, key: CacheKey) -> Self {
        self.key = key;
        self
    }

    /// Persist mutations through `ops`
    pub fn with_ops(mut self, ops: Arc<dyn PersistenceOps<T>>) -> Self {
        self.ops = ops;
        self
    }

    /// Use the critical TTL tier
    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    /// Where realtime inserts land
    pub fn insert_at(mut self, position: InsertPosition) -> Self {
        self.position = position;
        self
    }

    /// Dataset name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cache key
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    fn options(&self, force_refresh: bool) -> FetchOptions {
        FetchOptions::new()
            .critical(self.critical)
            .force_refresh(force_refresh)
    }

    /// Cached contents, fetching on miss or expiry
    pub async fn load(&self) -> Result<Vec<T>> {
        self.coordinator
            .with_cache(&self.key, self.options(false), || self.source.fetch())
            .await
    }

    /// Refetch regardless of freshness
    pub async fn refresh(&self) -> Result<Vec<T>> {
        self.coordinator
            .with_cache(&self.key, self.options(true), || self.source.fetch())
            .await
    }

    /// Current cached contents without fetching
    pub fn snapshot(&self) -> Result<Option<Vec<T>>> {
        Ok(self
            .coordinator
            .store()
            .get::<Vec<T>>(&self.key)?
            .and_then(|entry| entry.data))
    }

    /// Put `snapshot` back into the cache
    pub fn restore(&self, snapshot: Vec<T>) {
        self.coordinator.store().set(self.key.clone(), snapshot);
    }

    /// Edit the dataset optimistically and persist the difference
    ///
    /// The edited list is visible in the cache before any persistence call
    /// runs. Entities returned by `add` replace their optimistic versions.
    ///
    /// # Arguments
    /// * `edit` - Mutation applied to a copy of the current contents
    /// * `policy` - Whether failed persistence rolls the edit back
    ///
    /// # Returns
    /// * `Ok(report)` - Per-operation outcome; may contain failures under `KeepOptimistic`
    /// * `Err(ReconcileFailed)` - Some call failed under `Rollback`; cache restored
    pub async fn mutate<F>(&self, edit: F, policy: FailurePolicy) -> Result<ReconcileReport<T>>
    where
        F: FnOnce(&mut Vec<T>),
    {
        let previous = match self.snapshot()? {
            Some(current) => current,
            None => self.load().await?,
        };
        let mut next = previous.clone();
        edit(&mut next);

        let plan = reconcile::plan(&previous, &next)?;
        if plan.is_empty() {
            return Ok(ReconcileReport::default());
        }

        let store = self.coordinator.store();
        store.set(self.key.clone(), next);
        debug!(dataset = %self.name, changes = plan.len(), "applied optimistic edit");

        let report = reconcile::apply(&self.name, plan, self.ops.as_ref()).await;

        if !report.added.is_empty() {
            let persisted = &report.added;
            store.update::<Vec<T>, _, _>(&self.key, |list| {
                for stored in persisted {
                    if let Some(slot) = list.iter_mut().find(|item| item.id() == stored.id()) {
                        *slot = stored.clone();
                    }
                }
            })?;
        }

        if report.is_clean() {
            return Ok(report);
        }

        match policy {
            FailurePolicy::KeepOptimistic => {
                warn!(
                    dataset = %self.name,
                    failed = report.failures.len(),
                    "keeping optimistic edit despite persistence failures"
                );
                Ok(report)
            }
            FailurePolicy::Rollback => {
                warn!(
                    dataset = %self.name,
                    failed = report.failures.len(),
                    "rolling back optimistic edit"
                );
                self.restore(previous);
                Err(SyncError::ReconcileFailed {
                    dataset: self.name.clone(),
                    failed: report.failures.len(),
                })
            }
        }
    }

    /// Merge a realtime change into the cached contents
    ///
    /// Nothing cached means nothing to merge; the next fetch carries the
    /// change. An event that cannot be merged triggers a forced refresh.
    pub async fn apply_event(&self, event: &ChangeEvent) -> Result<MergeOutcome> {
        let position = self.position;
        let merged = self
            .coordinator
            .store()
            .update::<Vec<T>, _, _>(&self.key, |list| {
                merge_event(&self.name, list, event, position)
            })?;

        match merged {
            None => {
                debug!(dataset = %self.name, kind = ?event.kind, "nothing cached, event ignored");
                Ok(MergeOutcome::Ignored)
            }
            Some(Ok(outcome)) => {
                debug!(dataset = %self.name, kind = ?event.kind, ?outcome, "merged realtime event");
                Ok(outcome)
            }
            Some(Err(e)) => {
                warn!(dataset = %self.name, error = %e, "merge failed, refreshing dataset");
                self.refresh().await?;
                Ok(MergeOutcome::Refreshed)
            }
        }
    }

    /// Apply events from `events` in receipt order on a background task
    ///
    /// The task ends when the sender side is dropped.
    pub fn subscribe(self: Arc<Self>, mut events: mpsc::Receiver<ChangeEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(dataset = %self.name, "realtime subscription started");
            while let Some(event) = events.recv().await {
                if let Err(e) = self.apply_event(&event).await {
                    warn!(dataset = %self.name, error = %e, "realtime event dropped");
                }
            }
            info!(dataset = %self.name, "realtime subscription closed");
        })
    }
}
