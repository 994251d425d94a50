//! Timer worker: claims due timer tasks and runs them through the router.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use super::RuntimeConfig;
use crate::error::Error;
use crate::executor::{TaskOutcome, TimerTaskRouter};
use crate::store::{ExecutionStore, TimerTaskQueue};

/// Worker that polls the timer task queue.
///
/// # Lifecycle
///
/// 1. Poll for due tasks at `timer_poll_interval`
/// 2. Claim one task (locked for `timer_lock_duration`)
/// 3. Execute it within `attempt_timeout`
/// 4. Settle it according to the outcome or error
/// 5. Repeat until shutdown signal
pub(crate) struct TimerWorker<S, Q> {
    router: Arc<TimerTaskRouter<S>>,
    queue: Q,
    config: RuntimeConfig,
    worker_id: String,
}

impl<S, Q> TimerWorker<S, Q>
where
    S: ExecutionStore,
    Q: TimerTaskQueue,
{
    pub fn new(
        router: Arc<TimerTaskRouter<S>>,
        queue: Q,
        config: RuntimeConfig,
        worker_id: String,
    ) -> Self {
        Self {
            router,
            queue,
            config,
            worker_id,
        }
    }

    /// Run until the shutdown receiver signals. The task in flight, if any,
    /// is settled before exiting.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut poll_interval = interval(self.config.timer_poll_interval);
        poll_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(worker_id = %self.worker_id, "Timer worker started");

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    if let Err(e) = self.process_one().await {
                        error!(worker_id = %self.worker_id, error = %e, "Error processing timer task");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(worker_id = %self.worker_id, "Timer worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Claim and process one task. Returns `true` if a task was claimed.
    pub async fn process_one(&self) -> crate::Result<bool> {
        let Some(claimed) = self
            .queue
            .claim_due_task(&self.worker_id, self.config.timer_lock_duration)
            .await?
        else {
            return Ok(false);
        };
        let task = claimed.task;
        let attempt = claimed.attempts + 1;

        debug!(
            task_id = task.task_id,
            workflow = %task.workflow,
            task_type = %task.task_type,
            attempt,
            "Processing timer task"
        );

        let timeout = self.config.attempt_timeout;
        let result = tokio::time::timeout(timeout, self.router.execute(&task))
            .await
            .unwrap_or(Err(Error::Timeout(timeout)));

        match result {
            Ok(TaskOutcome::Completed) => {
                self.queue.complete(task.task_id).await?;
            }
            Ok(TaskOutcome::Discarded) => {
                warn!(task_id = task.task_id, workflow = %task.workflow, "Timer task discarded");
                self.queue.complete(task.task_id).await?;
            }
            Ok(TaskOutcome::Redispatch) => {
                self.queue
                    .redispatch(task.task_id, self.config.redispatch_delay)
                    .await?;
            }
            Err(e) => {
                let policy = &self.config.retry_policy;
                let backoff = if e.is_retryable() && policy.should_retry(attempt) {
                    warn!(task_id = task.task_id, error = %e, attempt, "Timer task failed, will retry");
                    policy.backoff_duration(attempt)
                } else {
                    error!(
                        task_id = task.task_id,
                        workflow = %task.workflow,
                        error = %e,
                        attempt,
                        "Timer task parked"
                    );
                    policy.max_delay
                };
                self.queue
                    .record_failure(task.task_id, &e.to_string(), backoff)
                    .await?;
            }
        }

        Ok(true)
    }
}
