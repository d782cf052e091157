// ============================================================================
// txbatch Library
// ============================================================================
//
// Applies a batch of insert/update/upsert/delete operations against a
// transactional document store as one atomic unit, writing an audit entry
// for each mutation inside the same transaction.
//
// ============================================================================

pub mod audit;
pub mod codec;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod server;
pub mod service;
pub mod store;
pub mod transaction;

// Re-export main types for convenience
pub use audit::{AuditLogEntry, AuditRecorder, AuditType};
pub use codec::{BatchRequest, Operation, OperationCodec, OperationKind};
pub use config::BatchConfig;
pub use core::{BatchError, Result, StoreError};
pub use dispatch::{Dispatch, MutationDispatcher};
pub use service::{BatchService, Reply};
pub use store::{MemoryStore, StoreGateway, StoreSession, WriteConcern};
pub use transaction::{ExecutionReport, RetryPolicy, TransactionExecutor};
