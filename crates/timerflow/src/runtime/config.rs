//! Runtime configuration.

use std::time::Duration;

use super::RetryPolicy;

/// Configuration for the timer worker runtime.
///
/// Controls polling, lock and attempt deadlines, retry behavior and worker
/// concurrency. Executor behavior is configured separately through
/// [`ExecutorConfig`](crate::ExecutorConfig).
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use timerflow::runtime::RuntimeConfig;
///
/// let config = RuntimeConfig {
///     timer_poll_interval: Duration::from_millis(200),
///     redispatch_delay: Duration::from_secs(2),
///     timer_workers: 4,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How often each worker polls for due timer tasks.
    ///
    /// Timer precision is limited by this interval.
    /// Default: 1 second.
    pub timer_poll_interval: Duration,

    /// How long a claimed task stays locked to its worker.
    ///
    /// If a worker crashes, the task becomes claimable after this duration.
    /// Default: 5 minutes.
    pub timer_lock_duration: Duration,

    /// Deadline for a single execution attempt, lease wait included.
    ///
    /// Default: 30 seconds.
    pub attempt_timeout: Duration,

    /// Delay before a redispatched task is delivered again.
    ///
    /// Default: 5 seconds.
    pub redispatch_delay: Duration,

    /// Maximum time to wait for in-flight tasks during shutdown.
    ///
    /// Default: 30 seconds.
    pub shutdown_timeout: Duration,

    /// Backoff for failed attempts.
    pub retry_policy: RetryPolicy,

    /// Worker identifier recorded on claimed tasks.
    ///
    /// If `None`, a UUID is generated at runtime startup.
    pub worker_id: Option<String>,

    /// Number of timer workers to spawn. Default: 1.
    pub timer_workers: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            timer_poll_interval: Duration::from_secs(1),
            timer_lock_duration: Duration::from_secs(300),
            attempt_timeout: Duration::from_secs(30),
            redispatch_delay: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
            worker_id: None,
            timer_workers: 1,
        }
    }
}
