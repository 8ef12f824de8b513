//! Stage retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::errors::StageError;
use crate::config::RetrySettings;

/// Attempt ceiling, exponential backoff and per-invocation deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    stage_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, stage_timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            stage_timeout,
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(
            settings.max_attempts,
            Duration::from_millis(settings.base_delay_ms),
            Duration::from_millis(settings.max_delay_ms),
            Duration::from_secs(settings.stage_timeout_secs),
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn stage_timeout(&self) -> Duration {
        self.stage_timeout
    }

    /// Whether a stage that has made `attempts` invocations and just failed
    /// with `error` gets another one.
    pub fn should_retry(&self, attempts: u32, error: &StageError) -> bool {
        error.is_retryable() && attempts < self.max_attempts
    }

    /// Backoff after the `attempts`-th failed invocation:
    /// `base * 2^(attempts - 1)`, capped.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Earliest start of the next attempt after a failure at `now`.
    pub fn next_eligible_at(&self, now: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for(attempts))
            .unwrap_or_else(|_| chrono::Duration::zero());
        now + delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(
            3,
            Duration::from_millis(100),
            Duration::from_millis(350),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = policy();
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
    }

    #[test]
    fn ceiling_counts_first_attempt() {
        let policy = policy();
        let transient = StageError::transient("busy");

        assert!(policy.should_retry(1, &transient));
        assert!(policy.should_retry(2, &transient));
        assert!(!policy.should_retry(3, &transient));
        assert!(!policy.should_retry(1, &StageError::fatal("bad input")));
    }

    #[test]
    fn next_eligible_is_after_now() {
        let policy = policy();
        let now = Utc::now();
        let next = policy.next_eligible_at(now, 2);
        assert_eq!((next - now).num_milliseconds(), 200);
    }

    #[test]
    fn defaults_follow_settings() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.stage_timeout(), Duration::from_secs(300));
    }
}
