// ============================================================================
// Transaction Execution Module
// ============================================================================
//
// A batch is applied inside a single store transaction. Each attempt runs
// every (dispatch, audit) pair in request order, then commits. Retryable
// failures re-run the whole attempt on the same session.
//
// Design Patterns Used:
// - State Pattern: attempt lifecycle (AttemptPhase)
// - Policy Object: retry limits and backoff (RetryPolicy)
//
// ============================================================================

pub mod executor;
pub mod retry;
pub mod state;

pub use executor::{ExecutionReport, TransactionExecutor};
pub use retry::RetryPolicy;
pub use state::{AttemptPhase, AttemptState};
