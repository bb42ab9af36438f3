//! Diff reconciler
//!
//! Turns an in-memory before/after pair of a dataset into the minimal set of
//! add / update / remove calls against the backing store. Matching is by id,
//! so list order never produces spurious operations.

use std::collections::{HashMap, HashSet};

use ahash::RandomState;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::entity::Entity;
use crate::error::{PersistOp, Result, SyncError};

/// Field-level patch: only the fields that changed, removed fields as `null`
pub type Changes = Map<String, Value>;

/// Persistence capabilities of a dataset.
///
/// Every method has a no-op default, so a dataset only overrides the
/// operations its backing store supports.
#[async_trait]
pub trait PersistenceOps<T: Entity>: Send + Sync {
    /// Create `item`, returning the stored version
    async fn add(&self, item: &T) -> Result<T> {
        Ok(item.clone())
    }

    /// Apply `changes` to the entity with `id`
    async fn update(&self, _id: &T::Id, _changes: &Changes) -> Result<()> {
        Ok(())
    }

    /// Delete the entity with `id`
    async fn remove(&self, _id: &T::Id) -> Result<()> {
        Ok(())
    }
}

/// Ops for datasets that are never written back
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPersistence;

impl<T: Entity> PersistenceOps<T> for NoPersistence {}

/// Operations needed to turn one version of a dataset into another
#[derive(Debug, Clone)]
pub struct DiffPlan<T: Entity> {
    /// Items present only in the next version, in next order
    pub additions: Vec<T>,
    /// Ids present in both versions whose value changed
    pub updates: Vec<(T::Id, Changes)>,
    /// Ids present only in the previous version, in previous order
    pub removals: Vec<T::Id>,
}

impl<T: Entity> DiffPlan<T> {
    /// Number of planned operations
    pub fn len(&self) -> usize {
        self.additions.len() + self.updates.len() + self.removals.len()
    }

    /// No operation needed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A persistence call that failed during reconciliation
#[derive(Debug, Clone, PartialEq)]
pub struct PersistenceFailure<Id> {
    /// Failed operation
    pub op: PersistOp,
    /// Entity the call was about
    pub id: Id,
    /// Error message
    pub reason: String,
}

/// Outcome of a reconciliation pass
#[derive(Debug, Clone)]
pub struct ReconcileReport<T: Entity> {
    /// Entities created, as returned by the backing store
    pub added: Vec<T>,
    /// Ids patched
    pub updated: Vec<T::Id>,
    /// Ids deleted
    pub removed: Vec<T::Id>,
    /// Calls that failed
    pub failures: Vec<PersistenceFailure<T::Id>>,
}

impl<T: Entity> Default for ReconcileReport<T> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
            failures: Vec::new(),
        }
    }
}

impl<T: Entity> ReconcileReport<T> {
    /// Every call succeeded
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of successful calls
    pub fn applied(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }
}

/// Compute the operations turning `previous` into `next`
///
/// Duplicate ids within one list resolve to the last occurrence.
pub fn plan<T: Entity>(previous: &[T], next: &[T]) -> Result<DiffPlan<T>> {
    let previous_by_id: HashMap<T::Id, &T, RandomState> =
        previous.iter().map(|item| (item.id(), item)).collect();
    let next_by_id: HashMap<T::Id, &T, RandomState> =
        next.iter().map(|item| (item.id(), item)).collect();

    let mut additions = Vec::new();
    let mut updates = Vec::new();
    let mut seen: HashSet<T::Id, RandomState> = HashSet::default();

    for item in next {
        let id = item.id();
        if !seen.insert(id.clone()) {
            continue;
        }
        let Some(current) = next_by_id.get(&id).copied() else {
            continue;
        };
        match previous_by_id.get(&id) {
            None => additions.push(current.clone()),
            Some(before) if *before != current => {
                let changes = field_changes(*before, current)?;
                if !changes.is_empty() {
                    updates.push((id, changes));
                }
            }
            Some(_) => {}
        }
    }

    let mut removals = Vec::new();
    seen.clear();
    for item in previous {
        let id = item.id();
        if !next_by_id.contains_key(&id) && seen.insert(id.clone()) {
            removals.push(id);
        }
    }

    Ok(DiffPlan {
        additions,
        updates,
        removals,
    })
}

/// Fields of `next` that differ from `previous`
///
/// Both values must serialize to JSON objects. Fields missing from `next` are
/// reported as `null`.
pub fn field_changes<T: Serialize>(previous: &T, next: &T) -> Result<Changes> {
    let before = to_object(previous)?;
    let after = to_object(next)?;

    let mut changes = Changes::new();
    for (field, value) in &after {
        if before.get(field) != Some(value) {
            changes.insert(field.clone(), value.clone());
        }
    }
    for field in before.keys() {
        if !after.contains_key(field) {
            changes.insert(field.clone(), Value::Null);
        }
    }
    Ok(changes)
}

pub(crate) fn to_object<T: Serialize>(value: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        _ => Err(SyncError::Serialization(serde::ser::Error::custom(
            "entity must serialize to a JSON object",
        ))),
    }
}

/// Diff `previous` against `next` and persist the difference through `ops`
///
/// Each call is awaited on its own; a failure is logged and recorded in the
/// report without stopping the remaining calls.
///
/// # Returns
/// * `Ok(report)` - Outcome per operation
/// * `Err(Serialization)` - Entities cannot be compared field by field
pub async fn reconcile<T: Entity>(
    dataset: &str,
    previous: &[T],
    next: &[T],
    ops: &dyn PersistenceOps<T>,
) -> Result<ReconcileReport<T>> {
    let plan = plan(previous, next)?;
    Ok(apply(dataset, plan, ops).await)
}

/// Run a precomputed plan through `ops`
pub async fn apply<T: Entity>(
    dataset: &str,
    plan: DiffPlan<T>,
    ops: &dyn PersistenceOps<T>,
) -> ReconcileReport<T> {
    let mut report = ReconcileReport::default();
    if plan.is_empty() {
        return report;
    }

    for item in plan.additions {
        match ops.add(&item).await {
            Ok(stored) => report.added.push(stored),
            Err(e) => report.failures.push(failure(dataset, PersistOp::Add, item.id(), e)),
        }
    }

    for (id, changes) in plan.updates {
        match ops.update(&id, &changes).await {
            Ok(()) => report.updated.push(id),
            Err(e) => report.failures.push(failure(dataset, PersistOp::Update, id, e)),
        }
    }

    for id in plan.removals {
        match ops.remove(&id).await {
            Ok(()) => report.removed.push(id),
            Err(e) => report.failures.push(failure(dataset, PersistOp::Remove, id, e)),
        }
    }

    debug!(
        dataset,
        added = report.added.len(),
        updated = report.updated.len(),
        removed = report.removed.len(),
        failed = report.failures.len(),
        "reconciled dataset"
    );
    report
}

fn failure<Id: std::fmt::Display>(
    dataset: &str,
    op: PersistOp,
    id: Id,
    error: SyncError,
) -> PersistenceFailure<Id> {
    warn!(dataset, %op, id = %id, error = %error, "persistence call failed");
    PersistenceFailure {
        op,
        id,
        reason: error.to_string(),
    }
}
