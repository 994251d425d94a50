//! Backoff for failed timer task attempts.

use std::time::Duration;

/// Exponential backoff applied by the timer worker when an attempt fails.
///
/// The delay before retry N is `min(base_delay * 2^(N-1), max_delay)`. Once
/// `max_attempts` attempts have failed the task is parked with `max_delay`
/// between deliveries instead of being dropped; timer tasks are never deleted
/// on failure.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use timerflow::runtime::RetryPolicy;
///
/// let policy = RetryPolicy {
///     max_attempts: 4,
///     base_delay: Duration::from_millis(200),
///     max_delay: Duration::from_secs(10),
/// };
/// assert_eq!(policy.backoff_duration(3), Duration::from_millis(800));
/// assert!(!policy.should_retry(4));
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before the task is parked, including the first.
    ///
    /// Default: 5.
    pub max_attempts: u32,

    /// Delay after the first failure; doubles with each further failure.
    ///
    /// Default: 1 second.
    pub base_delay: Duration,

    /// Cap on the delay, also used for parked tasks.
    ///
    /// Default: 5 minutes.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Returns `true` if the task should be retried on the regular schedule.
    ///
    /// `attempt` is the 1-based attempt that just failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the next delivery after `attempt` (1-based) failed.
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(multiplier).min(self.max_delay)
    }
}
