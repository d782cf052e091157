use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Label the store attaches to failures that are safe to retry as a whole transaction.
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";

/// Label the store attaches when it cannot confirm whether a commit took effect.
pub const UNKNOWN_TRANSACTION_COMMIT_RESULT: &str = "UnknownTransactionCommitResult";

/// Which store primitive produced a [`StoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    Session,
    Transaction,
    Write,
    Commit,
    Abort,
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Session => "session",
            Self::Transaction => "transaction",
            Self::Write => "write",
            Self::Commit => "commit",
            Self::Abort => "abort",
        };
        write!(f, "{label}")
    }
}

/// Error reported by a store gateway.
///
/// Carries the driver's message verbatim plus the error labels the driver
/// attached, which is what retry classification reads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct StoreError {
    kind: StoreErrorKind,
    message: String,
    labels: BTreeSet<String>,
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            labels: BTreeSet::new(),
        }
    }

    pub fn session(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Session, message)
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Transaction, message)
    }

    pub fn write(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Write, message)
    }

    pub fn commit(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Commit, message)
    }

    pub fn abort(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Abort, message)
    }

    /// Attach an error label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.insert(label.into());
        self
    }

    /// Shorthand for `with_label(TRANSIENT_TRANSACTION_ERROR)`.
    pub fn transient(self) -> Self {
        self.with_label(TRANSIENT_TRANSACTION_ERROR)
    }

    /// Shorthand for `with_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)`.
    pub fn commit_unknown(self) -> Self {
        self.with_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
    }

    pub fn kind(&self) -> StoreErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    pub fn is_transient(&self) -> bool {
        self.has_label(TRANSIENT_TRANSACTION_ERROR)
    }

    pub fn is_commit_unknown(&self) -> bool {
        self.has_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
    }
}

/// Which encoded field of an operation failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadField {
    Filter,
    Set,
}

impl fmt::Display for PayloadField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Filter => write!(f, "filter"),
            Self::Set => write!(f, "set"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadFault {
    #[error("invalid base64 string: {0}")]
    InvalidBase64(String),

    #[error("invalid bson document: {0}")]
    InvalidDocument(String),
}

/// A per-operation `filter`/`set` payload that could not be turned into a document.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid {field} for operation #{index} ({operation}): {fault}")]
pub struct PayloadDecodeError {
    pub index: usize,
    pub operation: String,
    pub field: PayloadField,
    pub fault: PayloadFault,
}

/// Batch-level failure. `Display` is the message sent back to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("Invalid request: {0}")]
    Decode(String),

    #[error(transparent)]
    Payload(#[from] PayloadDecodeError),

    #[error("No valid operations")]
    EmptyBatch,

    #[error("Failed to start session")]
    Session(#[source] StoreError),

    #[error("Failed to start transaction. {0}")]
    Transaction(#[source] StoreError),

    #[error("Aborting transaction. {source}")]
    Write {
        index: usize,
        collection: String,
        #[source]
        source: StoreError,
    },

    #[error("Aborting transaction. Failed to save audit log: {0}")]
    Audit(#[source] StoreError),

    #[error("{0}")]
    Commit(#[source] StoreError),

    #[error("Request cancelled")]
    Cancelled,
}

impl BatchError {
    /// The store-level failure underneath this error, if one exists.
    pub fn cause(&self) -> Option<&StoreError> {
        match self {
            Self::Session(err) | Self::Transaction(err) | Self::Audit(err) | Self::Commit(err) => {
                Some(err)
            }
            Self::Write { source, .. } => Some(source),
            Self::Decode(_) | Self::Payload(_) | Self::EmptyBatch | Self::Cancelled => None,
        }
    }

    /// `true` when the whole transaction attempt may be re-run.
    ///
    /// A commit whose outcome the store cannot confirm is retried, as is any
    /// failure whose cause carries the transient label. Session failures are
    /// surfaced immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Session(_) => false,
            Self::Commit(err) if err.is_commit_unknown() => true,
            other => other.cause().is_some_and(StoreError::is_transient),
        }
    }
}

pub type Result<T> = std::result::Result<T, BatchError>;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_batch_message_is_stable() {
        assert_eq!(BatchError::EmptyBatch.to_string(), "No valid operations");
    }

    #[test]
    fn test_write_error_message_includes_driver_text() {
        let err = BatchError::Write {
            index: 1,
            collection: "notes".into(),
            source: StoreError::write("E11000 duplicate key"),
        };
        assert_eq!(err.to_string(), "Aborting transaction. E11000 duplicate key");
        assert_eq!(err.cause().map(StoreError::kind), Some(StoreErrorKind::Write));
    }

    #[test]
    fn test_retry_classification() {
        let transient = BatchError::Write {
            index: 0,
            collection: "notes".into(),
            source: StoreError::write("WriteConflict").transient(),
        };
        assert!(transient.is_retryable());

        let ambiguous = BatchError::Commit(StoreError::commit("timeout").commit_unknown());
        assert!(ambiguous.is_retryable());

        // The unknown-commit label only counts on the commit step.
        let write_unknown = BatchError::Audit(StoreError::write("odd").commit_unknown());
        assert!(!write_unknown.is_retryable());

        let session = BatchError::Session(StoreError::session("no primary").transient());
        assert!(!session.is_retryable());

        let payload = BatchError::Payload(PayloadDecodeError {
            index: 0,
            operation: "insert".into(),
            field: PayloadField::Set,
            fault: PayloadFault::InvalidBase64("bad".into()),
        });
        assert!(!payload.is_retryable());
        assert!(payload.cause().is_none());
    }

    #[test]
    fn test_payload_error_names_operation_and_field() {
        let err = PayloadDecodeError {
            index: 2,
            operation: "update_one".into(),
            field: PayloadField::Filter,
            fault: PayloadFault::InvalidDocument("end of stream".into()),
        };
        assert_eq!(
            err.to_string(),
            "Invalid filter for operation #2 (update_one): invalid bson document: end of stream"
        );
    }
}
