//! JSON shape of a batch request as it arrives from the transport.

use super::encode_document;
use bson::Document;
use serde::{Deserialize, Deserializer, Serialize};

/// Batch request payload: `{actor_id, patient_id, operations: [...]}`.
///
/// Unknown fields are ignored; missing or `null` fields fall back to their
/// defaults, so a payload without `operations` decodes as an empty batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRequest {
    #[serde(default, deserialize_with = "null_as_default")]
    pub actor_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub patient_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub operations: Vec<WireOperation>,
}

/// One operation entry. `filter` and `set` are base64-wrapped BSON documents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireOperation {
    #[serde(default, deserialize_with = "null_as_default")]
    pub operation: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub collection: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub filter: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub set: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
}

impl WireRequest {
    pub fn new(actor_id: impl Into<String>, patient_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            patient_id: patient_id.into(),
            operations: Vec::new(),
        }
    }

    pub fn operation(mut self, operation: WireOperation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl WireOperation {
    pub fn new(operation: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            collection: collection.into(),
            ..Self::default()
        }
    }

    pub fn insert(collection: impl Into<String>, set: &Document) -> Self {
        Self::new("insert", collection).set(set)
    }

    pub fn update_one(collection: impl Into<String>, filter: &Document, set: &Document) -> Self {
        Self::new("update_one", collection).filter(filter).set(set)
    }

    pub fn upsert_one(collection: impl Into<String>, filter: &Document, set: &Document) -> Self {
        Self::new("upsert_one", collection).filter(filter).set(set)
    }

    pub fn delete_one(collection: impl Into<String>, filter: &Document) -> Self {
        Self::new("delete_one", collection).filter(filter)
    }

    /// Encode `filter` into the operation.
    pub fn filter(mut self, filter: &Document) -> Self {
        self.filter = encode_document(filter);
        self
    }

    /// Encode `set` into the operation.
    pub fn set(mut self, set: &Document) -> Self {
        self.set = encode_document(set);
        self
    }

    /// Use an already-encoded (possibly malformed) filter string.
    pub fn raw_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    /// Use an already-encoded (possibly malformed) set string.
    pub fn raw_set(mut self, set: impl Into<String>) -> Self {
        self.set = set.into();
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
