//! Realtime merger
//!
//! Applies insert/update/delete notifications pushed by the backing store to
//! a cached dataset. Payloads arrive as raw JSON because the channel may
//! deliver partial records; a payload that cannot be merged is reported as
//! [`SyncError::Merge`] and leaves the list untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::Entity;
use crate::error::{Result, SyncError};
use crate::reconcile::to_object;

/// Kind of change carried by a [`ChangeEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// New entity
    #[serde(alias = "INSERT")]
    Insert,
    /// Changed fields of an existing entity
    #[serde(alias = "UPDATE")]
    Update,
    /// Entity removed
    #[serde(alias = "DELETE")]
    Delete,
}

/// Out-of-band change notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// What happened
    pub kind: ChangeKind,
    /// Full record for inserts, at least the id field otherwise
    pub entity: Value,
}

impl ChangeEvent {
    /// Build an event from a typed entity
    pub fn from_entity<T: Entity>(kind: ChangeKind, entity: &T) -> Result<Self> {
        Ok(Self {
            kind,
            entity: serde_json::to_value(entity)?,
        })
    }

    /// Insert event
    pub fn insert<T: Entity>(entity: &T) -> Result<Self> {
        Self::from_entity(ChangeKind::Insert, entity)
    }

    /// Update event carrying the full entity
    pub fn update<T: Entity>(entity: &T) -> Result<Self> {
        Self::from_entity(ChangeKind::Update, entity)
    }

    /// Delete event carrying only the id
    pub fn delete<T: Entity>(id: &T::Id) -> Result<Self> {
        let mut entity = serde_json::Map::new();
        entity.insert(T::ID_FIELD.to_string(), serde_json::to_value(id)?);
        Ok(Self {
            kind: ChangeKind::Delete,
            entity: Value::Object(entity),
        })
    }
}

/// Where inserted entities land in the list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InsertPosition {
    /// Front of the list (newest first)
    #[default]
    Prepend,
    /// End of the list
    Append,
}

/// What applying an event did to the cached list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Entity added
    Inserted,
    /// Existing entity changed
    Updated,
    /// Entity removed
    Deleted,
    /// List already reflected the event, or nothing was cached
    Ignored,
    /// Merge failed and the dataset was refetched instead
    Refreshed,
}

/// Apply `event` to `list`
///
/// # Arguments
/// * `dataset` - Dataset name, used in errors
/// * `list` - Cached entities, mutated in place
/// * `event` - Change to apply
/// * `position` - Placement of inserted entities
///
/// # Returns
/// * `Ok(outcome)` - Effect on the list
/// * `Err(Merge)` - Malformed payload; `list` is unchanged
pub fn merge_event<T: Entity>(
    dataset: &str,
    list: &mut Vec<T>,
    event: &ChangeEvent,
    position: InsertPosition,
) -> Result<MergeOutcome> {
    let id = event_id::<T>(dataset, &event.entity)?;
    let found = list.iter().position(|item| item.id() == id);

    match (event.kind, found) {
        (ChangeKind::Insert, Some(_)) => Ok(MergeOutcome::Ignored),
        (ChangeKind::Insert, None) | (ChangeKind::Update, None) => {
            let item = decode::<T>(dataset, event.entity.clone())?;
            match position {
                InsertPosition::Prepend => list.insert(0, item),
                InsertPosition::Append => list.push(item),
            }
            Ok(MergeOutcome::Inserted)
        }
        (ChangeKind::Update, Some(index)) => {
            let incoming = match &event.entity {
                Value::Object(map) => map,
                _ => return Err(merge_error(dataset, "payload is not an object")),
            };
            let mut merged = to_object(&list[index])?;
            for (field, value) in incoming {
                merged.insert(field.clone(), value.clone());
            }
            let item = decode::<T>(dataset, Value::Object(merged))?;
            if item == list[index] {
                return Ok(MergeOutcome::Ignored);
            }
            list[index] = item;
            Ok(MergeOutcome::Updated)
        }
        (ChangeKind::Delete, Some(index)) => {
            list.remove(index);
            Ok(MergeOutcome::Deleted)
        }
        (ChangeKind::Delete, None) => Ok(MergeOutcome::Ignored),
    }
}

fn event_id<T: Entity>(dataset: &str, payload: &Value) -> Result<T::Id> {
    let Value::Object(map) = payload else {
        return Err(merge_error(dataset, "payload is not an object"));
    };
    let Some(raw) = map.get(T::ID_FIELD) else {
        return Err(merge_error(
            dataset,
            format!("payload has no `{}` field", T::ID_FIELD),
        ));
    };
    serde_json::from_value(raw.clone())
        .map_err(|e| merge_error(dataset, format!("bad `{}`: {}", T::ID_FIELD, e)))
}

fn decode<T: Entity>(dataset: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| merge_error(dataset, e))
}

fn merge_error(dataset: &str, reason: impl std::fmt::Display) -> SyncError {
    SyncError::Merge {
        dataset: dataset.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{row, Row};
    use serde_json::json;

    fn event(kind: ChangeKind, entity: Value) -> ChangeEvent {
        ChangeEvent { kind, entity }
    }

    #[test]
    fn test_insert_prepends_by_default() {
        let mut list = vec![row(1, 1)];
        let outcome = merge_event(
            "rows",
            &mut list,
            &event(ChangeKind::Insert, json!({"id": 2, "v": 5})),
            InsertPosition::default(),
        )
        .unwrap();

        assert_eq!(outcome, MergeOutcome::Inserted);
        assert_eq!(list, vec![row(2, 5), row(1, 1)]);
    }

    #[test]
    fn test_insert_appends() {
        let mut list = vec![row(1, 1)];
        merge_event(
            "rows",
            &mut list,
            &event(ChangeKind::Insert, json!({"id": 2, "v": 5})),
            InsertPosition::Append,
        )
        .unwrap();

        assert_eq!(list, vec![row(1, 1), row(2, 5)]);
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut list = vec![row(1, 1)];
        let insert = event(ChangeKind::Insert, json!({"id": 2, "v": 5}));

        merge_event("rows", &mut list, &insert, InsertPosition::Prepend).unwrap();
        let second = merge_event("rows", &mut list, &insert, InsertPosition::Prepend).unwrap();

        assert_eq!(second, MergeOutcome::Ignored);
        assert_eq!(list.len(), 2);
        assert_eq!(list.iter().filter(|r| r.id == 2).count(), 1);
    }

    #[test]
    fn test_update_merges_shallowly() {
        let mut list = vec![Row {
            id: 1,
            v: 1,
            note: Some("keep".into()),
        }];
        let outcome = merge_event(
            "rows",
            &mut list,
            &event(ChangeKind::Update, json!({"id": 1, "v": 9})),
            InsertPosition::Prepend,
        )
        .unwrap();

        assert_eq!(outcome, MergeOutcome::Updated);
        assert_eq!(list[0].v, 9);
        assert_eq!(list[0].note.as_deref(), Some("keep"));
    }

    #[test]
    fn test_repeated_update_is_ignored() {
        let mut list = vec![row(1, 1)];
        let update = event(ChangeKind::Update, json!({"id": 1, "v": 4}));

        merge_event("rows", &mut list, &update, InsertPosition::Prepend).unwrap();
        let again = merge_event("rows", &mut list, &update, InsertPosition::Prepend).unwrap();

        assert_eq!(again, MergeOutcome::Ignored);
        assert_eq!(list, vec![row(1, 4)]);
    }

    #[test]
    fn test_update_without_match_inserts() {
        let mut list = vec![row(1, 1)];
        let outcome = merge_event(
            "rows",
            &mut list,
            &event(ChangeKind::Update, json!({"id": 3, "v": 3})),
            InsertPosition::Append,
        )
        .unwrap();

        assert_eq!(outcome, MergeOutcome::Inserted);
        assert_eq!(list, vec![row(1, 1), row(3, 3)]);
    }

    #[test]
    fn test_delete_and_delete_absent() {
        let mut list = vec![row(1, 1), row(2, 2)];

        let first = merge_event(
            "rows",
            &mut list,
            &ChangeEvent::delete::<Row>(&1).unwrap(),
            InsertPosition::Prepend,
        )
        .unwrap();
        let second = merge_event(
            "rows",
            &mut list,
            &ChangeEvent::delete::<Row>(&1).unwrap(),
            InsertPosition::Prepend,
        )
        .unwrap();

        assert_eq!(first, MergeOutcome::Deleted);
        assert_eq!(second, MergeOutcome::Ignored);
        assert_eq!(list, vec![row(2, 2)]);
    }

    #[test]
    fn test_malformed_events_leave_list_untouched() {
        let original = vec![row(1, 1)];
        let bad = [
            event(ChangeKind::Insert, json!("not an object")),
            event(ChangeKind::Insert, json!({"v": 1})),
            event(ChangeKind::Update, json!({"id": "one", "v": 1})),
            event(ChangeKind::Update, json!({"id": 1, "v": "nine"})),
            event(ChangeKind::Insert, json!({"id": 5})),
        ];

        for ev in &bad {
            let mut list = original.clone();
            let err = merge_event("rows", &mut list, ev, InsertPosition::Prepend).unwrap_err();
            assert!(matches!(err, SyncError::Merge { .. }), "{:?}", ev);
            assert_eq!(list, original);
        }
    }

    #[test]
    fn test_event_kind_accepts_uppercase() {
        let ev: ChangeEvent =
            serde_json::from_value(json!({"kind": "UPDATE", "entity": {"id": 1}})).unwrap();
        assert_eq!(ev.kind, ChangeKind::Update);
    }
}
