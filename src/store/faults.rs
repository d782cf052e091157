use crate::core::{StoreError, StoreResult};
use std::sync::{Mutex, PoisonError};

/// Where a scripted fault fires.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    StartSession,
    StartTransaction,
    /// Any insert, update or delete against the named collection.
    Write(String),
    Commit,
}

impl FaultPoint {
    pub fn write(collection: impl Into<String>) -> Self {
        Self::Write(collection.into())
    }
}

#[derive(Debug)]
struct ScriptedFault {
    point: FaultPoint,
    error: StoreError,
    remaining: Option<u32>,
}

/// Scripted store failures, consumed in the order they were added.
///
/// Each fault fires a fixed number of times (or forever) and is then
/// discarded. Points without a live fault pass through.
#[derive(Debug, Default)]
pub struct FaultPlan {
    faults: Mutex<Vec<ScriptedFault>>,
}

impl FaultPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` hits of `point` with `error`.
    pub fn fail(&self, point: FaultPoint, error: StoreError, times: u32) -> &Self {
        if times > 0 {
            self.push(point, error, Some(times));
        }
        self
    }

    /// Fail every hit of `point` with `error` until [`clear`](Self::clear).
    pub fn fail_always(&self, point: FaultPoint, error: StoreError) -> &Self {
        self.push(point, error, None);
        self
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn check(&self, point: &FaultPoint) -> StoreResult<()> {
        let mut faults = self.lock();
        let Some(position) = faults.iter().position(|fault| &fault.point == point) else {
            return Ok(());
        };

        let error = faults[position].error.clone();
        let exhausted = match faults[position].remaining.as_mut() {
            Some(remaining) if *remaining <= 1 => true,
            Some(remaining) => {
                *remaining -= 1;
                false
            }
            None => false,
        };
        if exhausted {
            faults.remove(position);
        }
        Err(error)
    }

    fn push(&self, point: FaultPoint, error: StoreError, remaining: Option<u32>) {
        self.lock().push(ScriptedFault {
            point,
            error,
            remaining,
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ScriptedFault>> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_fires_requested_number_of_times() {
        let plan = FaultPlan::new();
        plan.fail(FaultPoint::Commit, StoreError::commit("boom").transient(), 2);

        assert!(plan.check(&FaultPoint::Commit).is_err());
        assert!(plan.check(&FaultPoint::StartSession).is_ok());
        assert!(plan.check(&FaultPoint::Commit).is_err());
        assert!(plan.check(&FaultPoint::Commit).is_ok());
        assert_eq!(plan.pending(), 0);
    }

    #[test]
    fn test_write_faults_are_scoped_to_collection() {
        let plan = FaultPlan::new();
        plan.fail_always(FaultPoint::write("audit_log"), StoreError::write("disk full"));

        assert!(plan.check(&FaultPoint::write("notes")).is_ok());
        assert!(plan.check(&FaultPoint::write("audit_log")).is_err());
        assert!(plan.check(&FaultPoint::write("audit_log")).is_err());

        plan.clear();
        assert!(plan.check(&FaultPoint::write("audit_log")).is_ok());
    }
}
