// ============================================================================
// Operation Codec
// ============================================================================
//
// Turns the transport's JSON batch payload into typed operations. The outer
// structure is decoded eagerly; each operation's base64/BSON `filter` and
// `set` payloads are decoded lazily, on first access by the dispatcher.
//
// ============================================================================

pub mod operation;
pub mod wire;

pub use operation::{Attribution, BatchRequest, EncodedDocument, Operation, OperationKind};
pub use wire::{WireOperation, WireRequest};

use crate::core::{BatchError, Result};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bson::Document;

pub struct OperationCodec;

impl OperationCodec {
    /// Decode a raw batch payload.
    ///
    /// Only the JSON envelope is validated here. An empty operation list is
    /// not an error at this stage.
    pub fn decode(raw: &[u8]) -> Result<BatchRequest> {
        let wire: WireRequest =
            serde_json::from_slice(raw).map_err(|err| BatchError::Decode(err.to_string()))?;
        Ok(BatchRequest::from_wire(wire))
    }

    pub fn decode_str(raw: &str) -> Result<BatchRequest> {
        Self::decode(raw.as_bytes())
    }
}

/// Encode a document the way `filter`/`set` travel on the wire.
///
/// A document that cannot be serialized yields an empty string, which is
/// rejected as a payload error when the operation is dispatched.
pub fn encode_document(document: &Document) -> String {
    bson::to_vec(document)
        .map(|bytes| STANDARD.encode(bytes))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PayloadFault, PayloadField};
    use bson::doc;

    fn sample_payload() -> String {
        WireRequest::new("A", "P")
            .operation(WireOperation::insert("notes", &doc! { "text": "hi" }).id("op-1"))
            .operation(WireOperation::update_one(
                "notes",
                &doc! { "text": "hi" },
                &doc! { "$set": { "text": "bye" } },
            ))
            .to_json()
            .unwrap()
    }

    #[test]
    fn test_decode_batch() {
        let request = OperationCodec::decode_str(&sample_payload()).unwrap();

        assert_eq!(request.actor_id(), "A");
        assert_eq!(request.patient_id(), "P");
        assert_eq!(request.len(), 2);

        let insert = &request.operations()[0];
        assert_eq!(insert.kind(), &OperationKind::Insert);
        assert_eq!(insert.collection(), "notes");
        assert_eq!(insert.id(), "op-1");
        assert_eq!(insert.set().unwrap(), &doc! { "text": "hi" });
        assert!(insert.encoded_filter().is_empty());

        let update = &request.operations()[1];
        assert_eq!(update.index(), 1);
        assert_eq!(update.kind(), &OperationKind::UpdateOne);
        assert_eq!(update.filter().unwrap(), &doc! { "text": "hi" });
    }

    #[test]
    fn test_decode_is_idempotent() {
        let payload = sample_payload();
        let first = OperationCodec::decode_str(&payload).unwrap();
        let second = OperationCodec::decode_str(&payload).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_operations_is_empty_batch() {
        let request = OperationCodec::decode_str(r#"{"actor_id":"A","extra":true}"#).unwrap();
        assert!(request.is_empty());
        assert_eq!(request.patient_id(), "");

        let request = OperationCodec::decode_str(r#"{"operations":null}"#).unwrap();
        assert!(request.is_empty());
    }

    #[test]
    fn test_malformed_envelope_is_decode_error() {
        let err = OperationCodec::decode_str("{not json").unwrap_err();
        assert!(matches!(err, BatchError::Decode(_)));

        let err = OperationCodec::decode_str(r#"{"operations":"insert"}"#).unwrap_err();
        assert!(matches!(err, BatchError::Decode(_)));
    }

    #[test]
    fn test_unknown_kind_is_kept_as_unsupported() {
        let payload = WireRequest::new("A", "P")
            .operation(WireOperation::new("replace_many", "notes"))
            .to_json()
            .unwrap();
        let request = OperationCodec::decode_str(&payload).unwrap();
        let kind = request.operations()[0].kind();
        assert_eq!(kind, &OperationKind::Unsupported("replace_many".into()));
        assert!(!kind.is_supported());
        assert_eq!(kind.to_string(), "replace_many");
    }

    #[test]
    fn test_payloads_decode_lazily() {
        let payload = WireRequest::new("A", "P")
            .operation(WireOperation::new("delete_one", "notes").raw_filter("%%%"))
            .to_json()
            .unwrap();

        // The envelope decodes even though the filter is garbage.
        let request = OperationCodec::decode_str(&payload).unwrap();
        let op = &request.operations()[0];
        assert!(!op.encoded_filter().is_decoded());

        let err = op.filter().unwrap_err();
        assert!(op.encoded_filter().is_decoded());
        assert_eq!(err.index, 0);
        assert_eq!(err.operation, "delete_one");
        assert_eq!(err.field, PayloadField::Filter);
        assert!(matches!(err.fault, PayloadFault::InvalidBase64(_)));
    }

    #[test]
    fn test_valid_base64_that_is_not_bson() {
        let not_bson = STANDARD.encode(b"hello");
        let op = Operation::from_wire(3, WireOperation::new("insert", "notes").raw_set(not_bson));
        let err = op.set().unwrap_err();
        assert_eq!(err.field, PayloadField::Set);
        assert!(matches!(err.fault, PayloadFault::InvalidDocument(_)));
    }

    #[test]
    fn test_empty_payload_is_rejected_on_access() {
        let op = Operation::from_wire(0, WireOperation::new("update_one", "notes"));
        assert!(matches!(
            op.set().unwrap_err().fault,
            PayloadFault::InvalidDocument(_)
        ));
    }

    #[test]
    fn test_summary_lists_filters_for_non_inserts() {
        let request = OperationCodec::decode_str(&sample_payload()).unwrap();
        let summary = request.summary();
        assert!(summary.starts_with("[{collection: notes, operation: insert}, "));
        assert!(summary.contains("operation: update_one, filter: "));
    }
}
