//! Timer task execution.
//!
//! [`TimerTaskExecutor`] is one template shared by both modes. Each delivery:
//!
//! 1. Reads the shard clock once for the guard's cluster
//! 2. Acquires the execution lease and loads (or refreshes) mutable state
//! 3. Computes the transitions the task makes due
//! 4. Nothing due: the task is already handled and completes
//! 5. Otherwise asks the [`TaskGuard`] whether to apply them, wait, fetch
//!    history or give up
//!
//! Write conflicts reload and retry up to `max_update_attempts` times. All
//! other errors are returned to the dispatch layer with the lease released.

mod config;
mod guard;
mod handlers;
mod router;

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{debug, error, warn};

pub use config::ExecutorConfig;
pub use guard::{ActiveGuard, GuardDecision, StandbyGuard, TaskGuard};
pub use router::TimerTaskRouter;

use crate::cache::{ExecutionCache, WorkflowContext};
use crate::clock::ShardClock;
use crate::error::{Error, Result};
use crate::mutable_state::{MutableState, TransactionPolicy, VersionHistoryItem};
use crate::store::{ClusterMetadata, ExecutionStore};
use crate::task::{TimerTask, TimerTaskType};

/// Result of a successfully processed delivery, consumed by the dispatch layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The task is done (acted upon or already handled); delete it.
    Completed,
    /// Leave the task in place and deliver it again later.
    Redispatch,
    /// Abandon the task; delete it without acting.
    Discarded,
}

impl TaskOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOutcome::Completed => "completed",
            TaskOutcome::Redispatch => "redispatch",
            TaskOutcome::Discarded => "discarded",
        }
    }
}

impl std::fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

enum Step {
    Done(TaskOutcome),
    FetchHistory(VersionHistoryItem),
}

/// Executes timer tasks for one mode, selected by the guard `G`.
///
/// # Example
///
/// ```ignore
/// let executor = TimerTaskExecutor::new(
///     store.clone(),
///     cache.clone(),
///     clock.clone(),
///     metadata.clone(),
///     ActiveGuard::new("cluster-a"),
///     ExecutorConfig::default(),
/// )?;
///
/// match executor.execute(&task).await? {
///     TaskOutcome::Completed | TaskOutcome::Discarded => queue.complete(task.task_id).await?,
///     TaskOutcome::Redispatch => queue.redispatch(task.task_id, delay).await?,
/// }
/// ```
pub struct TimerTaskExecutor<S, G> {
    store: S,
    cache: Arc<ExecutionCache>,
    clock: Arc<ShardClock>,
    metadata: Arc<dyn ClusterMetadata>,
    guard: G,
    config: ExecutorConfig,
}

impl<S, G> TimerTaskExecutor<S, G>
where
    S: ExecutionStore,
    G: TaskGuard,
{
    /// Create an executor. Fails if `config` does not validate.
    pub fn new(
        store: S,
        cache: Arc<ExecutionCache>,
        clock: Arc<ShardClock>,
        metadata: Arc<dyn ClusterMetadata>,
        guard: G,
        config: ExecutorConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            cache,
            clock,
            metadata,
            guard,
            config,
        })
    }

    pub fn guard(&self) -> &G {
        &self.guard
    }

    /// Process one delivery of `task`.
    pub async fn execute(&self, task: &TimerTask) -> Result<TaskOutcome> {
        let mode = self.guard.mode();
        if !self.guard.owns(task) {
            debug!(
                task_id = task.task_id,
                workflow = %task.workflow,
                task_type = %task.task_type,
                mode,
                "Task not handled in this mode"
            );
            return Ok(TaskOutcome::Completed);
        }

        let now = self.clock.now(self.guard.cluster());
        let reference = self.guard.reference_time(task, now);
        let verify_version = self
            .metadata
            .is_global_domain(task.workflow.domain_id())
            .await?;

        let mut attempt = 1;
        loop {
            let mut context = self
                .cache
                .acquire(&task.workflow, self.config.lease_timeout)
                .await?;
            match self
                .process(&mut context, task, now, reference, verify_version)
                .await
            {
                Ok(Step::Done(outcome)) => {
                    debug!(
                        task_id = task.task_id,
                        workflow = %task.workflow,
                        task_type = %task.task_type,
                        mode,
                        %outcome,
                        "Timer task processed"
                    );
                    return Ok(outcome);
                }
                Ok(Step::FetchHistory(from)) => {
                    drop(context);
                    debug!(
                        task_id = task.task_id,
                        workflow = %task.workflow,
                        from_event_id = from.event_id,
                        from_version = from.version,
                        "Requesting history resend"
                    );
                    self.guard
                        .fetch_history(&task.workflow, from)
                        .await
                        .map_err(|err| match err {
                            Error::Resend { .. } => err,
                            other => Error::Resend {
                                workflow: task.workflow.clone(),
                                message: other.to_string(),
                            },
                        })?;
                    return Ok(TaskOutcome::Redispatch);
                }
                Err(err @ Error::ConditionFailed { .. })
                    if attempt < self.config.max_update_attempts =>
                {
                    context.clear();
                    warn!(
                        task_id = task.task_id,
                        workflow = %task.workflow,
                        attempt,
                        error = %err,
                        "Conflict updating mutable state, reloading"
                    );
                    attempt += 1;
                }
                Err(err) => {
                    context.clear();
                    if err.is_retryable() {
                        debug!(task_id = task.task_id, workflow = %task.workflow, error = %err, "Timer task failed");
                    } else {
                        error!(
                            task_id = task.task_id,
                            workflow = %task.workflow,
                            task_type = %task.task_type,
                            error = %err,
                            "Timer task cannot be processed"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn process(
        &self,
        context: &mut WorkflowContext,
        task: &TimerTask,
        now: OffsetDateTime,
        reference: OffsetDateTime,
        verify_version: bool,
    ) -> Result<Step> {
        let Some(state) = self.load_fresh(context, task).await? else {
            return Ok(Step::Done(TaskOutcome::Completed));
        };
        if !state.is_running() {
            return Ok(Step::Done(TaskOutcome::Completed));
        }

        let due = handlers::due_transitions(state, task, reference, verify_version)?;
        if due.is_empty() {
            if handlers::awaits_expiry(state, task, reference, verify_version) {
                debug!(
                    task_id = task.task_id,
                    workflow = %task.workflow,
                    visibility = %task.visibility_timestamp,
                    %reference,
                    "Timer task delivered before it is due"
                );
                return Ok(Step::Done(TaskOutcome::Redispatch));
            }
            if task.task_type == TimerTaskType::ActivityTimeout
                && handlers::refresh_activity_timers(state, task)?
            {
                context.persist(&self.store, TransactionPolicy::Passive).await?;
            }
            return Ok(Step::Done(TaskOutcome::Completed));
        }

        match self.guard.check(task, now) {
            GuardDecision::Proceed => {
                handlers::clear_heartbeat_timer(state, task);
                handlers::apply_transitions(state, &due, now)?;
                context.persist(&self.store, TransactionPolicy::Active).await?;
                Ok(Step::Done(TaskOutcome::Completed))
            }
            GuardDecision::Redispatch => Ok(Step::Done(TaskOutcome::Redispatch)),
            GuardDecision::FetchHistory => {
                let from = state.version_histories().current().last_item()?;
                Ok(Step::FetchHistory(from))
            }
            GuardDecision::Discard => {
                warn!(
                    task_id = task.task_id,
                    workflow = %task.workflow,
                    task_type = %task.task_type,
                    visibility = %task.visibility_timestamp,
                    "Discarding timer task, standby state too far behind"
                );
                Ok(Step::Done(TaskOutcome::Discarded))
            }
        }
    }

    /// Load state for `task`, reloading once if the cached copy has not seen
    /// the task's event yet. `None` means there is nothing to act on.
    async fn load_fresh<'a>(
        &self,
        context: &'a mut WorkflowContext,
        task: &TimerTask,
    ) -> Result<Option<&'a mut MutableState>> {
        let Some(stale) = self.is_stale(context, task).await? else {
            return Ok(None);
        };
        if stale {
            context.clear();
            match self.is_stale(context, task).await? {
                None => return Ok(None),
                Some(true) => {
                    debug!(
                        task_id = task.task_id,
                        workflow = %task.workflow,
                        event_id = task.event_id,
                        "Task references an event not in mutable state, skipping"
                    );
                    return Ok(None);
                }
                Some(false) => {}
            }
        }
        context.load(&self.store).await
    }

    async fn is_stale(&self, context: &mut WorkflowContext, task: &TimerTask) -> Result<Option<bool>> {
        let Some(state) = context.load(&self.store).await? else {
            debug!(workflow = %task.workflow, "Workflow execution not found");
            return Ok(None);
        };
        Ok(Some(task.event_id >= state.next_event_id()))
    }
}
