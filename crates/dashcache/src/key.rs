//! Deterministic cache keys

use std::fmt;

use serde::Serialize;

use crate::error::{Result, SyncError};

/// Cache key derived from an operation name and its parameters.
///
/// The textual form is `operation:params`, where `params` is the canonical
/// JSON encoding of the parameters. Object fields serialize in sorted order,
/// so two logically identical parameter sets always produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive a key for `operation` called with `params`
    ///
    /// # Arguments
    /// * `operation` - Operation name, non-empty and free of `:`
    /// * `params` - Any serializable parameter set
    ///
    /// # Returns
    /// * `Result<CacheKey>` - `InvalidKey` if the operation name is malformed
    pub fn new<P: Serialize + ?Sized>(operation: &str, params: &P) -> Result<Self> {
        validate_operation(operation)?;

        // Round-trip through Value so struct fields and map keys come out sorted
        let value = serde_json::to_value(params)
            .map_err(|e| SyncError::InvalidKey(format!("{}: {}", operation, e)))?;
        let encoded = serde_json::to_string(&value)
            .map_err(|e| SyncError::InvalidKey(format!("{}: {}", operation, e)))?;

        Ok(Self(format!("{}:{}", operation, encoded)))
    }

    /// Key for a parameterless dataset
    pub fn named(operation: &str) -> Result<Self> {
        validate_operation(operation)?;
        Ok(Self(format!("{}:null", operation)))
    }

    /// Operation name the key was derived from
    pub fn operation(&self) -> &str {
        self.0.split_once(':').map(|(op, _)| op).unwrap_or(&self.0)
    }

    /// Full textual key
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_operation(operation: &str) -> Result<()> {
    if operation.trim().is_empty() {
        return Err(SyncError::InvalidKey("operation name is empty".to_string()));
    }
    if operation.contains(':') {
        return Err(SyncError::InvalidKey(format!(
            "operation name '{}' contains ':'",
            operation
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_key_is_deterministic() {
        let mut a = HashMap::new();
        a.insert("status", "open");
        a.insert("clinic", "north");

        let mut b = HashMap::new();
        b.insert("clinic", "north");
        b.insert("status", "open");

        let key_a = CacheKey::new("orders", &a).unwrap();
        let key_b = CacheKey::new("orders", &b).unwrap();
        assert_eq!(key_a, key_b);
        assert_eq!(key_a.as_str(), r#"orders:{"clinic":"north","status":"open"}"#);
    }

    #[test]
    fn test_distinct_queries_do_not_collide() {
        let by_clinic = CacheKey::new("orders", &json!({"clinic": "north"})).unwrap();
        let by_status = CacheKey::new("orders", &json!({"status": "north"})).unwrap();
        let other_op = CacheKey::new("expenses", &json!({"clinic": "north"})).unwrap();

        assert_ne!(by_clinic, by_status);
        assert_ne!(by_clinic, other_op);
    }

    #[test]
    fn test_named_key() {
        let key = CacheKey::named("clinics").unwrap();
        assert_eq!(key.operation(), "clinics");
        assert_eq!(key, CacheKey::new("clinics", &()).unwrap());
    }

    #[test]
    fn test_malformed_operation_rejected() {
        assert!(matches!(
            CacheKey::named(""),
            Err(SyncError::InvalidKey(_))
        ));
        assert!(matches!(
            CacheKey::new("orders:open", &1),
            Err(SyncError::InvalidKey(_))
        ));
    }
}
