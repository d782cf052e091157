use super::wire::{WireOperation, WireRequest};
use crate::core::{PayloadDecodeError, PayloadFault, PayloadField};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bson::Document;
use std::fmt;
use std::sync::OnceLock;

/// Closed set of operation kinds. Unrecognized tags are kept so they can be
/// logged and skipped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Insert,
    UpdateOne,
    UpsertOne,
    DeleteOne,
    Unsupported(String),
}

impl OperationKind {
    pub fn parse(tag: &str) -> Self {
        match tag {
            "insert" => Self::Insert,
            "update_one" => Self::UpdateOne,
            "upsert_one" => Self::UpsertOne,
            "delete_one" => Self::DeleteOne,
            other => Self::Unsupported(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Insert => "insert",
            Self::UpdateOne => "update_one",
            Self::UpsertOne => "upsert_one",
            Self::DeleteOne => "delete_one",
            Self::Unsupported(tag) => tag,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Unsupported(_))
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A base64-wrapped BSON document, decoded on first access and cached.
///
/// The cached result (document or fault) survives transaction retries, so
/// a retried attempt never decodes the same payload twice.
#[derive(Debug, Clone, Default)]
pub struct EncodedDocument {
    encoded: String,
    decoded: OnceLock<Result<Document, PayloadFault>>,
}

impl EncodedDocument {
    pub fn new(encoded: impl Into<String>) -> Self {
        Self {
            encoded: encoded.into(),
            decoded: OnceLock::new(),
        }
    }

    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    pub fn is_empty(&self) -> bool {
        self.encoded.is_empty()
    }

    pub fn is_decoded(&self) -> bool {
        self.decoded.get().is_some()
    }

    pub fn decode(&self) -> Result<&Document, &PayloadFault> {
        self.decoded
            .get_or_init(|| decode_payload(&self.encoded))
            .as_ref()
    }
}

impl PartialEq for EncodedDocument {
    fn eq(&self, other: &Self) -> bool {
        self.encoded == other.encoded
    }
}

impl Eq for EncodedDocument {}

fn decode_payload(encoded: &str) -> Result<Document, PayloadFault> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|err| PayloadFault::InvalidBase64(err.to_string()))?;
    bson::from_slice::<Document>(&bytes).map_err(|err| PayloadFault::InvalidDocument(err.to_string()))
}

/// One requested mutation, positioned at `index` in its batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    index: usize,
    kind: OperationKind,
    collection: String,
    filter: EncodedDocument,
    set: EncodedDocument,
    id: String,
}

impl Operation {
    pub fn from_wire(index: usize, wire: WireOperation) -> Self {
        Self {
            index,
            kind: OperationKind::parse(&wire.operation),
            collection: wire.collection,
            filter: EncodedDocument::new(wire.filter),
            set: EncodedDocument::new(wire.set),
            id: wire.id,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> &OperationKind {
        &self.kind
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Caller-supplied correlation token, never interpreted.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn encoded_filter(&self) -> &EncodedDocument {
        &self.filter
    }

    pub fn encoded_set(&self) -> &EncodedDocument {
        &self.set
    }

    /// Decoded `filter` document.
    pub fn filter(&self) -> Result<&Document, PayloadDecodeError> {
        self.filter
            .decode()
            .map_err(|fault| self.payload_error(PayloadField::Filter, fault))
    }

    /// Decoded `set` document.
    pub fn set(&self) -> Result<&Document, PayloadDecodeError> {
        self.set
            .decode()
            .map_err(|fault| self.payload_error(PayloadField::Set, fault))
    }

    fn payload_error(&self, field: PayloadField, fault: &PayloadFault) -> PayloadDecodeError {
        PayloadDecodeError {
            index: self.index,
            operation: self.kind.as_str().to_string(),
            field,
            fault: fault.clone(),
        }
    }

    fn summary(&self) -> String {
        match self.kind {
            OperationKind::Insert | OperationKind::Unsupported(_) => format!(
                "{{collection: {}, operation: {}}}",
                self.collection, self.kind
            ),
            _ => format!(
                "{{collection: {}, operation: {}, filter: {}}}",
                self.collection,
                self.kind,
                self.filter.encoded()
            ),
        }
    }
}

/// Who performed a batch and whom it concerns; copied into audit entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attribution {
    pub actor_id: String,
    pub patient_id: String,
}

/// A decoded batch. Immutable once built and reused across retry attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRequest {
    attribution: Attribution,
    operations: Vec<Operation>,
}

impl BatchRequest {
    pub fn from_wire(wire: WireRequest) -> Self {
        let operations = wire
            .operations
            .into_iter()
            .enumerate()
            .map(|(index, op)| Operation::from_wire(index, op))
            .collect();

        Self {
            attribution: Attribution {
                actor_id: wire.actor_id,
                patient_id: wire.patient_id,
            },
            operations,
        }
    }

    pub fn attribution(&self) -> &Attribution {
        &self.attribution
    }

    pub fn actor_id(&self) -> &str {
        &self.attribution.actor_id
    }

    pub fn patient_id(&self) -> &str {
        &self.attribution.patient_id
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// One-line description of every operation, used for request logging.
    pub fn summary(&self) -> String {
        let parts: Vec<String> = self.operations.iter().map(Operation::summary).collect();
        format!("[{}]", parts.join(", "))
    }
}
