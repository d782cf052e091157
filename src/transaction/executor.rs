use super::retry::RetryPolicy;
use super::state::{AttemptPhase, AttemptState};
use crate::audit::AuditRecorder;
use crate::codec::BatchRequest;
use crate::config::BatchConfig;
use crate::core::{BatchError, Result};
use crate::dispatch::{Dispatch, MutationDispatcher};
use crate::store::{StoreGateway, StoreSession, WriteConcern};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counts from the attempt that committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecutionReport {
    pub attempts: u32,
    pub applied: usize,
    pub skipped: usize,
}

/// Runs a whole batch inside one store transaction, re-running the entire
/// transaction when the store reports a retryable failure.
#[derive(Clone)]
pub struct TransactionExecutor {
    store: Arc<dyn StoreGateway>,
    dispatcher: MutationDispatcher,
    auditor: AuditRecorder,
    write_concern: WriteConcern,
    retry: RetryPolicy,
}

impl TransactionExecutor {
    pub fn new(store: Arc<dyn StoreGateway>, config: &BatchConfig) -> Self {
        Self {
            store,
            dispatcher: MutationDispatcher::new(),
            auditor: AuditRecorder::new(config.audit_collection.clone(), config.audit_enabled),
            write_concern: config.write_concern,
            retry: config.retry.clone(),
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn auditor(&self) -> &AuditRecorder {
        &self.auditor
    }

    /// Execute `request` atomically.
    ///
    /// One session scopes every attempt and is always ended before this
    /// returns. `cancel` is raced against each store call and the backoff
    /// sleep between attempts.
    pub async fn run(
        &self,
        request: &BatchRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport> {
        let mut session = guarded(cancel, self.store.start_session())
            .await?
            .map_err(BatchError::Session)?;

        let mut state = AttemptState::new();
        state.advance(AttemptPhase::SessionOpen);

        let result = self
            .run_attempts(session.as_mut(), request, cancel, &mut state)
            .await;

        session.end_session().await;
        debug!(attempts = state.attempt(), "Store session ended");
        result
    }

    async fn run_attempts(
        &self,
        session: &mut dyn StoreSession,
        request: &BatchRequest,
        cancel: &CancellationToken,
        state: &mut AttemptState,
    ) -> Result<ExecutionReport> {
        loop {
            state.begin_attempt();
            let attempt = state.attempt();

            match self.attempt(session, request, cancel, state).await {
                Ok(mut report) => {
                    report.attempts = attempt;
                    info!(
                        attempt,
                        applied = report.applied,
                        skipped = report.skipped,
                        "Transaction committed"
                    );
                    return Ok(report);
                }
                Err(err) => {
                    if !self.retry.should_retry(attempt, &err) {
                        error!(
                            attempt,
                            phase = %state.phase(),
                            cause = ?err.cause(),
                            "Transaction failed: {err}"
                        );
                        return Err(err);
                    }

                    let backoff = self.retry.delay_after(attempt);
                    warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "Retrying transaction: {err}"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(BatchError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }

    async fn attempt(
        &self,
        session: &mut dyn StoreSession,
        request: &BatchRequest,
        cancel: &CancellationToken,
        state: &mut AttemptState,
    ) -> Result<ExecutionReport> {
        if let Err(err) = guarded(cancel, session.start_transaction(self.write_concern))
            .await
            .and_then(|started| started.map_err(BatchError::Transaction))
        {
            state.advance(AttemptPhase::Failed);
            return Err(err);
        }
        state.advance(AttemptPhase::TransactionOpen);

        let mut report = ExecutionReport::default();
        for operation in request.operations() {
            state.advance(AttemptPhase::Executing(operation.index()));

            let step = async {
                let dispatch = self
                    .dispatcher
                    .apply(session, request.attribution(), operation)
                    .await?;
                if let Dispatch::Applied { draft, .. } = &dispatch {
                    self.auditor.record(session, draft.clone()).await?;
                }
                Ok::<_, BatchError>(dispatch)
            };

            match guarded(cancel, step).await.and_then(|step| step) {
                Ok(Dispatch::Applied { .. }) => report.applied += 1,
                Ok(Dispatch::Skipped { .. }) => report.skipped += 1,
                Err(err) => {
                    self.abort(session, state).await;
                    return Err(err);
                }
            }
        }

        state.advance(AttemptPhase::Committing);
        match guarded(cancel, session.commit_transaction()).await {
            Ok(Ok(())) => {
                state.advance(AttemptPhase::Done);
                Ok(report)
            }
            Ok(Err(err)) => {
                state.advance(AttemptPhase::Failed);
                Err(BatchError::Commit(err))
            }
            Err(cancelled) => {
                self.abort(session, state).await;
                Err(cancelled)
            }
        }
    }

    /// Roll back the open transaction. The attempt's own error is what
    /// the caller sees, so an abort failure is only logged.
    async fn abort(&self, session: &mut dyn StoreSession, state: &mut AttemptState) {
        state.advance(AttemptPhase::Aborting);
        if let Err(err) = session.abort_transaction().await {
            warn!(attempt = state.attempt(), "Failed to abort transaction: {err}");
        }
        state.advance(AttemptPhase::Failed);
    }
}

async fn guarded<T>(cancel: &CancellationToken, call: impl Future<Output = T>) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BatchError::Cancelled),
        value = call => Ok(value),
    }
}
