// ============================================================================
// Store Gateway
// ============================================================================
//
// The seam between the batch executor and the document store. The store
// owns sessions, transactions and connection pooling; the executor only
// drives them through these traits.
//
// ============================================================================

pub mod faults;
pub mod matcher;
pub mod memory;
#[cfg(feature = "mongodb")]
pub mod mongo;

pub use faults::{FaultPlan, FaultPoint};
pub use memory::MemoryStore;
#[cfg(feature = "mongodb")]
pub use mongo::MongoGateway;

use crate::core::StoreResult;
use async_trait::async_trait;
use bson::{Bson, Document};
use std::fmt;

/// Acknowledgment a transaction commit must collect before it counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteConcern {
    #[default]
    Majority,
    Nodes(u32),
}

impl WriteConcern {
    /// `0` keeps the majority default; any other value asks for that many nodes.
    pub fn from_override(nodes: u32) -> Self {
        match nodes {
            0 => Self::Majority,
            n => Self::Nodes(n),
        }
    }
}

impl fmt::Display for WriteConcern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Majority => write!(f, "majority"),
            Self::Nodes(n) => write!(f, "w={n}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertOutcome {
    pub inserted_id: Bson,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
    pub upserted_id: Option<Bson>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteOutcome {
    pub deleted: u64,
}

/// Result of one mutation, as reported by the store.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Inserted(InsertOutcome),
    Updated(UpdateOutcome),
    Deleted(DeleteOutcome),
}

impl fmt::Display for WriteOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inserted(outcome) => write!(f, "Inserted: {}", outcome.inserted_id),
            Self::Updated(outcome) => {
                write!(
                    f,
                    "Matched: {}, Modified: {}",
                    outcome.matched, outcome.modified
                )?;
                if let Some(id) = &outcome.upserted_id {
                    write!(f, ", Upserted: {id}")?;
                }
                Ok(())
            }
            Self::Deleted(outcome) => write!(f, "Deleted: {}", outcome.deleted),
        }
    }
}

/// Entry point to the store. Shared by every in-flight batch.
#[async_trait]
pub trait StoreGateway: Send + Sync {
    async fn start_session(&self) -> StoreResult<Box<dyn StoreSession>>;
}

/// A store session scoping one or more transaction attempts.
///
/// Mutations issued between `start_transaction` and `commit_transaction` /
/// `abort_transaction` belong to that transaction.
#[async_trait]
pub trait StoreSession: Send {
    async fn start_transaction(&mut self, write_concern: WriteConcern) -> StoreResult<()>;

    async fn insert_one(&mut self, collection: &str, document: &Document)
    -> StoreResult<InsertOutcome>;

    /// Update the first document matching `filter`. With `upsert`, a document
    /// is created when nothing matches.
    async fn update_one(
        &mut self,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> StoreResult<UpdateOutcome>;

    async fn delete_one(&mut self, collection: &str, filter: &Document)
    -> StoreResult<DeleteOutcome>;

    async fn commit_transaction(&mut self) -> StoreResult<()>;

    async fn abort_transaction(&mut self) -> StoreResult<()>;

    async fn end_session(&mut self);
}
