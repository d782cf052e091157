use crate::core::BatchError;
use std::time::Duration;

/// How many times a batch's transaction may be re-run, and how long to wait
/// between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `None` keeps retrying for as long as failures stay retryable.
    pub max_attempts: Option<u32>,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Stop after `max_attempts` attempts in total. `0` means unbounded.
    pub fn bounded(max_attempts: u32) -> Self {
        Self::default().max_attempts(max_attempts)
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = (max_attempts > 0).then_some(max_attempts);
        self
    }

    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max.max(base);
        self
    }

    /// Retry immediately.
    pub fn no_backoff(self) -> Self {
        self.backoff(Duration::ZERO, Duration::ZERO)
    }

    /// Whether attempt number `attempt` (1-based) may be followed by another.
    pub fn allows_another(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt < max)
    }

    pub fn should_retry(&self, attempt: u32, err: &BatchError) -> bool {
        err.is_retryable() && self.allows_another(attempt)
    }

    /// Exponential delay after attempt number `attempt`, capped at `max_backoff`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if self.base_backoff.is_zero() {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StoreError;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::unbounded()
            .backoff(Duration::from_millis(10), Duration::from_millis(50));
        assert_eq!(policy.delay_after(1), Duration::from_millis(10));
        assert_eq!(policy.delay_after(2), Duration::from_millis(20));
        assert_eq!(policy.delay_after(3), Duration::from_millis(40));
        assert_eq!(policy.delay_after(4), Duration::from_millis(50));
        assert_eq!(policy.delay_after(40), Duration::from_millis(50));
    }

    #[test]
    fn test_zero_base_never_sleeps() {
        let policy = RetryPolicy::unbounded().no_backoff();
        assert_eq!(policy.delay_after(5), Duration::ZERO);
    }

    #[test]
    fn test_attempt_cap() {
        assert!(RetryPolicy::unbounded().allows_another(10_000));
        assert!(RetryPolicy::bounded(0).allows_another(10_000));

        let policy = RetryPolicy::bounded(3);
        assert!(policy.allows_another(2));
        assert!(!policy.allows_another(3));
    }

    #[test]
    fn test_only_retryable_errors_are_retried() {
        let policy = RetryPolicy::unbounded();
        let transient = BatchError::Commit(StoreError::commit("conflict").transient());
        let terminal = BatchError::Commit(StoreError::commit("bad"));
        assert!(policy.should_retry(1, &transient));
        assert!(!policy.should_retry(1, &terminal));
        assert!(!policy.should_retry(1, &BatchError::Cancelled));
    }
}
