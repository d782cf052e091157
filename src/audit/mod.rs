// ============================================================================
// Audit Recorder
// ============================================================================
//
// Every successful mutation is described by one audit entry written through
// the same store session, inside the same transaction. An aborted attempt
// therefore takes its audit entries with it.
//
// ============================================================================

use crate::core::{BatchError, Result};
use crate::store::StoreSession;
use bson::{Bson, Document, doc};
use chrono::{DateTime, Utc};
use std::fmt;
use tracing::debug;

/// Fixed vocabulary of the audit log `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditType {
    Insert,
    Update,
    Delete,
}

impl AuditType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for AuditType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the dispatcher knows about a mutation once it has succeeded.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditDraft {
    pub collection: String,
    pub actor_id: String,
    pub patient_id: Option<String>,
    pub params: Option<Document>,
    pub filter: Option<Document>,
    pub kind: AuditType,
}

impl AuditDraft {
    pub fn with_params(mut self, params: Document) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_filter(mut self, filter: Document) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// A persisted audit record.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditLogEntry {
    pub collection: String,
    pub actor_id: String,
    pub patient_id: Option<String>,
    pub params: Option<Document>,
    pub filter: Option<Document>,
    pub kind: AuditType,
    pub inserted_at: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn from_draft(draft: AuditDraft, inserted_at: DateTime<Utc>) -> Self {
        Self {
            collection: draft.collection,
            actor_id: draft.actor_id,
            patient_id: draft.patient_id,
            params: draft.params,
            filter: draft.filter,
            kind: draft.kind,
            inserted_at,
        }
    }

    /// Stored shape. Empty strings and absent documents are left out.
    pub fn to_document(&self) -> Document {
        let mut document = Document::new();
        if !self.collection.is_empty() {
            document.insert("collection", self.collection.as_str());
        }
        if !self.actor_id.is_empty() {
            document.insert("actor_id", self.actor_id.as_str());
        }
        if let Some(patient_id) = self.patient_id.as_deref().filter(|id| !id.is_empty()) {
            document.insert("patient_id", patient_id);
        }
        if let Some(params) = &self.params {
            document.insert("params", params.clone());
        }
        if let Some(filter) = &self.filter {
            document.insert("filter", filter.clone());
        }
        document.insert("type", self.kind.as_str());
        document.insert(
            "inserted_at",
            Bson::DateTime(bson::DateTime::from_millis(
                self.inserted_at.timestamp_millis(),
            )),
        );
        document
    }
}

/// Writes audit entries into a fixed collection, or does nothing when disabled.
#[derive(Debug, Clone)]
pub struct AuditRecorder {
    collection: String,
    enabled: bool,
}

impl AuditRecorder {
    pub fn new(collection: impl Into<String>, enabled: bool) -> Self {
        Self {
            collection: collection.into(),
            enabled,
        }
    }

    pub fn disabled() -> Self {
        Self::new(String::new(), false)
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Persist `draft` through `session`. A store failure aborts the batch.
    pub async fn record(&self, session: &mut dyn StoreSession, draft: AuditDraft) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let entry = AuditLogEntry::from_draft(draft, Utc::now());
        session
            .insert_one(&self.collection, &entry.to_document())
            .await
            .map_err(BatchError::Audit)?;
        debug!(
            collection = %entry.collection,
            kind = %entry.kind,
            "Saved audit log entry"
        );
        Ok(())
    }
}

/// Read a stored audit document back, for inspection and tests.
pub fn entry_summary(document: &Document) -> Document {
    let mut summary = doc! {};
    for key in ["collection", "actor_id", "patient_id", "params", "filter", "type"] {
        if let Some(value) = document.get(key) {
            summary.insert(key, value.clone());
        }
    }
    summary
}
