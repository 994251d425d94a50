//! Mode-specific guards for the shared executor template.
//!
//! The executor computes which transitions a task makes due; the guard decides
//! what to do about them. The active guard always proceeds. The standby guard
//! never mutates: due work means replication has not delivered the active
//! cluster's outcome yet, and the guard picks a staleness band.
//!
//! ```text
//!   visibility        + resend_delay          + discard_delay
//!       |----- Redispatch -----|---- FetchHistory ----|---- Discard ---->
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;

use super::config::ExecutorConfig;
use crate::error::Result;
use crate::mutable_state::VersionHistoryItem;
use crate::store::HistoryResender;
use crate::task::{TimeoutType, TimerTask, TimerTaskType};
use crate::workflow::WorkflowKey;

/// What to do with a task whose transitions are due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    /// Apply the transitions and persist.
    Proceed,
    /// Leave state untouched and retry later.
    Redispatch,
    /// Request history catch-up, then retry later.
    FetchHistory,
    /// Give up on the task.
    Discard,
}

/// Strategy separating active from standby execution.
#[async_trait]
pub trait TaskGuard: Send + Sync + 'static {
    /// `"active"` or `"standby"`, for logs.
    fn mode(&self) -> &'static str;

    /// Cluster whose clock supplies "now".
    fn cluster(&self) -> &str;

    /// Whether this mode evaluates the task at all. Unowned tasks succeed
    /// without loading state.
    fn owns(&self, task: &TimerTask) -> bool;

    /// Time against which timer expiry is judged.
    fn reference_time(&self, task: &TimerTask, now: OffsetDateTime) -> OffsetDateTime;

    fn check(&self, task: &TimerTask, now: OffsetDateTime) -> GuardDecision;

    /// Request the events after `from` for `workflow`.
    async fn fetch_history(&self, _workflow: &WorkflowKey, _from: VersionHistoryItem) -> Result<()> {
        Ok(())
    }
}

/// Guard for tasks of executions active in this cluster.
#[derive(Debug, Clone)]
pub struct ActiveGuard {
    cluster: String,
}

impl ActiveGuard {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
        }
    }
}

#[async_trait]
impl TaskGuard for ActiveGuard {
    fn mode(&self) -> &'static str {
        "active"
    }

    fn cluster(&self) -> &str {
        &self.cluster
    }

    fn owns(&self, _task: &TimerTask) -> bool {
        true
    }

    fn reference_time(&self, _task: &TimerTask, now: OffsetDateTime) -> OffsetDateTime {
        now
    }

    fn check(&self, _task: &TimerTask, _now: OffsetDateTime) -> GuardDecision {
        GuardDecision::Proceed
    }
}

/// Guard for tasks replicated from `cluster`, which is active for them.
pub struct StandbyGuard {
    cluster: String,
    resender: Arc<dyn HistoryResender>,
    resend_delay: time::Duration,
    discard_delay: time::Duration,
}

impl StandbyGuard {
    pub fn new(
        cluster: impl Into<String>,
        resender: Arc<dyn HistoryResender>,
        config: &ExecutorConfig,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            resender,
            resend_delay: to_time_duration(config.resend_delay),
            discard_delay: to_time_duration(config.discard_delay),
        }
    }
}

fn to_time_duration(duration: std::time::Duration) -> time::Duration {
    time::Duration::try_from(duration).unwrap_or(time::Duration::MAX)
}

#[async_trait]
impl TaskGuard for StandbyGuard {
    fn mode(&self) -> &'static str {
        "standby"
    }

    fn cluster(&self) -> &str {
        &self.cluster
    }

    // Sticky decision schedule-to-start timeouts and activity retry timers are
    // resolved only by the active cluster.
    fn owns(&self, task: &TimerTask) -> bool {
        match task.task_type {
            TimerTaskType::DecisionTimeout => {
                task.timeout_type != Some(TimeoutType::ScheduleToStart)
            }
            TimerTaskType::ActivityRetryTimer => false,
            _ => true,
        }
    }

    fn reference_time(&self, task: &TimerTask, _now: OffsetDateTime) -> OffsetDateTime {
        task.visibility_timestamp
    }

    fn check(&self, task: &TimerTask, now: OffsetDateTime) -> GuardDecision {
        let within = |delay: time::Duration| {
            task.visibility_timestamp
                .checked_add(delay)
                .is_none_or(|deadline| now < deadline)
        };
        if within(self.resend_delay) {
            GuardDecision::Redispatch
        } else if within(self.discard_delay) {
            GuardDecision::FetchHistory
        } else {
            GuardDecision::Discard
        }
    }

    async fn fetch_history(&self, workflow: &WorkflowKey, from: VersionHistoryItem) -> Result<()> {
        self.resender
            .send_single_workflow_history(workflow, from.event_id, from.version)
            .await
    }
}
