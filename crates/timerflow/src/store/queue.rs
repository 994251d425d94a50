//! Timer task queue operations for the timer worker.

use std::time::Duration;

use async_trait::async_trait;

use crate::task::TimerTask;

/// A claimed timer task, ready for execution.
#[derive(Debug, Clone)]
pub struct ClaimedTimerTask {
    pub task: TimerTask,
    /// Number of previous failed attempts (0 for first try).
    pub attempts: u32,
}

/// Delivery of persisted timer tasks.
///
/// # Locking Protocol
///
/// 1. `claim_due_task` atomically selects the earliest eligible task whose
///    visibility timestamp has passed and locks it for `lock_duration`
/// 2. `complete`, `redispatch` or `record_failure` settles it before the lock expires
/// 3. If a worker crashes, the lock expires and another worker can claim it
#[async_trait]
pub trait TimerTaskQueue: Send + Sync + Clone + 'static {
    /// Claim the next due task, or `None` if nothing is due.
    async fn claim_due_task(
        &self,
        worker_id: &str,
        lock_duration: Duration,
    ) -> crate::Result<Option<ClaimedTimerTask>>;

    /// Delete the task; it was handled or deliberately discarded.
    async fn complete(&self, task_id: i64) -> crate::Result<()>;

    /// Release the task unchanged and make it claimable again after `delay`.
    ///
    /// Does not count as a failed attempt.
    async fn redispatch(&self, task_id: i64, delay: Duration) -> crate::Result<()>;

    /// Release the task after a failed attempt and make it claimable after `backoff`.
    async fn record_failure(&self, task_id: i64, error: &str, backoff: Duration)
    -> crate::Result<()>;
}
