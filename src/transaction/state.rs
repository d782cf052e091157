// ============================================================================
// Attempt State
// ============================================================================
//
// One transaction attempt moves through:
//
//   Idle -> SessionOpen -> TransactionOpen -> Executing(i) -> Committing -> Done
//                                   |              |              |
//                                   +--------------+-> Aborting --+-> Failed
//
// A failed commit goes straight to Failed; the store has already closed the
// transaction.
//
// ============================================================================

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptPhase {
    Idle,
    SessionOpen,
    TransactionOpen,
    /// Dispatching the operation at this index.
    Executing(usize),
    Committing,
    Aborting,
    Done,
    Failed,
}

impl AttemptPhase {
    /// Whether a store transaction is open in this phase.
    pub fn in_transaction(&self) -> bool {
        matches!(
            self,
            Self::TransactionOpen | Self::Executing(_) | Self::Committing
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn can_transition_to(&self, next: AttemptPhase) -> bool {
        use AttemptPhase::*;
        match (*self, next) {
            (Idle, SessionOpen) => true,
            (SessionOpen, TransactionOpen) => true,
            (SessionOpen, Failed) => true,
            (TransactionOpen, Executing(0)) => true,
            (Executing(i), Executing(j)) => j == i + 1,
            (TransactionOpen | Executing(_), Committing) => true,
            (TransactionOpen | Executing(_), Aborting) => true,
            (Committing, Done | Failed | Aborting) => true,
            (Aborting, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for AttemptPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::SessionOpen => write!(f, "SESSION_OPEN"),
            Self::TransactionOpen => write!(f, "TRANSACTION_OPEN"),
            Self::Executing(index) => write!(f, "EXECUTING({index})"),
            Self::Committing => write!(f, "COMMITTING"),
            Self::Aborting => write!(f, "ABORTING"),
            Self::Done => write!(f, "DONE"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Tracks the current phase of the attempt in flight.
#[derive(Debug)]
pub struct AttemptState {
    attempt: u32,
    phase: AttemptPhase,
}

impl AttemptState {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            phase: AttemptPhase::Idle,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn phase(&self) -> AttemptPhase {
        self.phase
    }

    /// Start the next attempt. A retried attempt reuses the open session.
    pub fn begin_attempt(&mut self) {
        self.attempt += 1;
        if self.phase == AttemptPhase::Failed {
            self.phase = AttemptPhase::SessionOpen;
        }
    }

    pub fn advance(&mut self, next: AttemptPhase) {
        debug_assert!(
            self.phase.can_transition_to(next),
            "invalid attempt transition {} -> {}",
            self.phase,
            next
        );
        tracing::trace!(attempt = self.attempt, from = %self.phase, to = %next, "attempt phase");
        self.phase = next;
    }
}

impl Default for AttemptState {
    fn default() -> Self {
        Self::new()
    }
}
