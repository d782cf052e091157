// ============================================================================
// Batch Service
// ============================================================================
//
// Entry point for the transport. Decodes a raw batch, rejects empty ones
// before any store work, runs the rest through the TransactionExecutor and
// maps the outcome to a reply.
//
// ============================================================================

use crate::codec::OperationCodec;
use crate::config::BatchConfig;
use crate::core::{BatchError, Result};
use crate::store::StoreGateway;
use crate::transaction::{ExecutionReport, TransactionExecutor};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span};

/// Reply sent back to the caller for one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    Ok,
    Error { message: String },
}

impl Reply {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Ok => None,
            Self::Error { message } => Some(message),
        }
    }
}

impl From<&Result<ExecutionReport>> for Reply {
    fn from(result: &Result<ExecutionReport>) -> Self {
        match result {
            Ok(_) => Self::Ok,
            Err(err) => Self::error(err.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct BatchService {
    executor: TransactionExecutor,
    request_timeout: Option<Duration>,
}

impl BatchService {
    pub fn new(store: Arc<dyn StoreGateway>, config: &BatchConfig) -> Self {
        Self {
            executor: TransactionExecutor::new(store, config),
            request_timeout: config.request_timeout,
        }
    }

    pub fn executor(&self) -> &TransactionExecutor {
        &self.executor
    }

    /// Handle one raw batch payload.
    pub async fn handle(&self, raw: &[u8]) -> Reply {
        self.handle_with(raw, "", &CancellationToken::new()).await
    }

    /// Handle one raw batch payload on behalf of `request_id`, giving up
    /// when `cancel` fires.
    pub async fn handle_with(&self, raw: &[u8], request_id: &str, cancel: &CancellationToken) -> Reply {
        let span = info_span!("batch", request_id = %request_id);
        let result = self.execute(raw, cancel).instrument(span.clone()).await;

        if let Err(err) = &result {
            let _entered = span.enter();
            error!(cause = ?err.cause(), "Batch failed: {err}");
        }
        Reply::from(&result)
    }

    /// Decode and run a batch, returning the executor's report or the
    /// terminal error.
    pub async fn execute(&self, raw: &[u8], cancel: &CancellationToken) -> Result<ExecutionReport> {
        let request = OperationCodec::decode(raw)?;
        if request.is_empty() {
            return Err(BatchError::EmptyBatch);
        }
        info!(
            actor_id = request.actor_id(),
            operations = request.len(),
            "Received batch: {}",
            request.summary()
        );

        let Some(timeout) = self.request_timeout else {
            return self.executor.run(&request, cancel).await;
        };

        let scoped = cancel.child_token();
        let run = self.executor.run(&request, &scoped);
        tokio::pin!(run);
        tokio::select! {
            result = &mut run => result,
            _ = tokio::time::sleep(timeout) => {
                scoped.cancel();
                run.await
            }
        }
    }
}
