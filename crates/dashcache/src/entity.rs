//! Entity contract for dataset items

use std::fmt::{Debug, Display};
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Item of a dataset, identified by a stable unique id.
///
/// The engine never looks past the id; field-level diffs and realtime merges
/// operate on the serde object form of the entity.
pub trait Entity: Clone + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Identifier type
    type Id: Clone + Eq + Hash + Debug + Display + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Name of the id field in the serialized form
    const ID_FIELD: &'static str = "id";

    /// Stable unique id
    fn id(&self) -> Self::Id;
}
