//! Shared fixtures for unit tests

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::{PersistOp, Result, SyncError};
use crate::reconcile::{Changes, PersistenceOps};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: u32,
    pub v: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Entity for Row {
    type Id = u32;

    fn id(&self) -> u32 {
        self.id
    }
}

pub fn row(id: u32, v: i32) -> Row {
    Row { id, v, note: None }
}

/// Records every call as a string; optionally fails calls for one id
pub struct RecordingOps {
    calls: Mutex<Vec<String>>,
    fail_id: Option<u32>,
}

impl RecordingOps {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_id: None,
        }
    }

    pub fn failing_on(id: u32) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_id: Some(id),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn check(&self, op: PersistOp, id: u32) -> Result<()> {
        if self.fail_id == Some(id) {
            return Err(SyncError::persistence("rows", op, "backend rejected write"));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceOps<Row> for RecordingOps {
    async fn add(&self, item: &Row) -> Result<Row> {
        self.check(PersistOp::Add, item.id)?;
        let encoded = serde_json::to_string(item)?;
        self.calls.lock().push(format!("add {}", encoded));
        Ok(item.clone())
    }

    async fn update(&self, id: &u32, changes: &Changes) -> Result<()> {
        self.check(PersistOp::Update, *id)?;
        let encoded = serde_json::to_string(changes)?;
        self.calls.lock().push(format!("update {} {}", id, encoded));
        Ok(())
    }

    async fn remove(&self, id: &u32) -> Result<()> {
        self.check(PersistOp::Remove, *id)?;
        self.calls.lock().push(format!("remove {}", id));
        Ok(())
    }
}
