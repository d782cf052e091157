// ============================================================================
// Mutation Dispatcher
// ============================================================================
//
// Routes one decoded operation to the matching store mutation and turns the
// store's answer into an audit draft. Audit typing:
//
//   insert                    -> INSERT
//   update_one / upsert_one   -> UPDATE if modified > 0, otherwise INSERT
//   delete_one                -> DELETE (filter only, no patient id)
//
// Unsupported kinds are skipped without touching the store.
//
// ============================================================================

use crate::audit::{AuditDraft, AuditType};
use crate::codec::{Attribution, Operation, OperationKind};
use crate::core::{BatchError, Result, StoreError};
use crate::store::{StoreSession, UpdateOutcome, WriteOutcome};
use tracing::{debug, info};

/// What happened to one operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// The store applied the mutation; `draft` must be recorded next.
    Applied {
        outcome: WriteOutcome,
        draft: AuditDraft,
    },
    /// The operation kind is not recognized and was left alone.
    Skipped { tag: String },
}

impl Dispatch {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MutationDispatcher;

impl MutationDispatcher {
    pub fn new() -> Self {
        Self
    }

    pub async fn apply(
        &self,
        session: &mut dyn StoreSession,
        attribution: &Attribution,
        operation: &Operation,
    ) -> Result<Dispatch> {
        let collection = operation.collection();

        let dispatch = match operation.kind() {
            OperationKind::Insert => {
                let set = operation.set()?;
                let outcome = session
                    .insert_one(collection, set)
                    .await
                    .map_err(|err| write_error(operation, err))?;
                Dispatch::Applied {
                    draft: draft(attribution, operation, AuditType::Insert)
                        .with_params(set.clone()),
                    outcome: WriteOutcome::Inserted(outcome),
                }
            }
            OperationKind::UpdateOne | OperationKind::UpsertOne => {
                let upsert = *operation.kind() == OperationKind::UpsertOne;
                let filter = operation.filter()?;
                let set = operation.set()?;
                let outcome = session
                    .update_one(collection, filter, set, upsert)
                    .await
                    .map_err(|err| write_error(operation, err))?;
                Dispatch::Applied {
                    draft: draft(attribution, operation, update_audit_type(&outcome))
                        .with_params(set.clone())
                        .with_filter(filter.clone()),
                    outcome: WriteOutcome::Updated(outcome),
                }
            }
            OperationKind::DeleteOne => {
                let filter = operation.filter()?;
                let outcome = session
                    .delete_one(collection, filter)
                    .await
                    .map_err(|err| write_error(operation, err))?;
                let mut draft =
                    draft(attribution, operation, AuditType::Delete).with_filter(filter.clone());
                draft.patient_id = None;
                Dispatch::Applied {
                    outcome: WriteOutcome::Deleted(outcome),
                    draft,
                }
            }
            OperationKind::Unsupported(tag) => {
                info!(
                    index = operation.index(),
                    collection,
                    operation = %tag,
                    "Unsupported operation, skipping"
                );
                return Ok(Dispatch::Skipped { tag: tag.clone() });
            }
        };

        if let Dispatch::Applied { outcome, .. } = &dispatch {
            debug!(
                index = operation.index(),
                collection,
                operation = %operation.kind(),
                "{outcome}"
            );
        }
        Ok(dispatch)
    }
}

/// A zero modified count is recorded as an insertion, whatever the match count.
pub fn update_audit_type(outcome: &UpdateOutcome) -> AuditType {
    if outcome.modified > 0 {
        AuditType::Update
    } else {
        AuditType::Insert
    }
}

fn draft(attribution: &Attribution, operation: &Operation, kind: AuditType) -> AuditDraft {
    AuditDraft {
        collection: operation.collection().to_string(),
        actor_id: attribution.actor_id.clone(),
        patient_id: Some(attribution.patient_id.clone()),
        params: None,
        filter: None,
        kind,
    }
}

fn write_error(operation: &Operation, source: StoreError) -> BatchError {
    BatchError::Write {
        index: operation.index(),
        collection: operation.collection().to_string(),
        source,
    }
}
