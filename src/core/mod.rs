pub mod error;

pub use error::{
    BatchError, PayloadDecodeError, PayloadFault, PayloadField, Result, StoreError,
    StoreErrorKind, StoreResult, TRANSIENT_TRANSACTION_ERROR, UNKNOWN_TRANSACTION_COMMIT_RESULT,
};
