//! Persisted task records produced by workflow transitions.
//!
//! Timer tasks are the ordered work items consumed by the
//! [`TimerTaskExecutor`](crate::TimerTaskExecutor). Each one becomes eligible
//! at its `visibility_timestamp` and is re-evaluated against mutable state when
//! delivered, so a task that outlived the thing it refers to is harmless.
//!
//! | Task type | Created when | Referenced event |
//! |-----------|--------------|------------------|
//! | `UserTimer` | earliest pending user timer has no task yet | timer started event |
//! | `ActivityTimeout` | earliest eligible activity timeout has no task yet | activity scheduled event |
//! | `DecisionTimeout` | decision scheduled (sticky) or started | decision scheduled event |
//! | `WorkflowTimeout` | workflow started | workflow started event |
//! | `WorkflowBackoffTimer` | workflow started with a first-decision backoff | workflow started event |
//! | `ActivityRetryTimer` | activity retried after a timeout | activity scheduled event |
//!
//! Transfer tasks are the immediate counterpart (dispatch a decision or an
//! activity, close the execution). They are emitted alongside timer tasks but
//! consumed by a different queue.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::workflow::WorkflowKey;

/// Category of a timer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TimerTaskType {
    UserTimer,
    ActivityTimeout,
    DecisionTimeout,
    WorkflowTimeout,
    WorkflowBackoffTimer,
    ActivityRetryTimer,
}

impl TimerTaskType {
    /// Stable name used in logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            TimerTaskType::UserTimer => "user_timer",
            TimerTaskType::ActivityTimeout => "activity_timeout",
            TimerTaskType::DecisionTimeout => "decision_timeout",
            TimerTaskType::WorkflowTimeout => "workflow_timeout",
            TimerTaskType::WorkflowBackoffTimer => "workflow_backoff_timer",
            TimerTaskType::ActivityRetryTimer => "activity_retry_timer",
        }
    }
}

impl std::fmt::Display for TimerTaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timeout sub-kind for activity and decision timeouts.
///
/// The declaration order is the tie-break priority used when two timers
/// share a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TimeoutType {
    StartToClose,
    ScheduleToStart,
    ScheduleToClose,
    Heartbeat,
}

impl TimeoutType {
    /// All timeout types in priority order.
    pub const ALL: [TimeoutType; 4] = [
        TimeoutType::StartToClose,
        TimeoutType::ScheduleToStart,
        TimeoutType::ScheduleToClose,
        TimeoutType::Heartbeat,
    ];

    /// Tie-break priority (lower sorts first).
    pub const fn priority(self) -> u8 {
        match self {
            TimeoutType::StartToClose => 0,
            TimeoutType::ScheduleToStart => 1,
            TimeoutType::ScheduleToClose => 2,
            TimeoutType::Heartbeat => 3,
        }
    }
}

/// A persisted timer task.
///
/// # Example
///
/// ```
/// use time::OffsetDateTime;
/// use timerflow::{TimeoutType, TimerTask, TimerTaskType, WorkflowKey};
///
/// let task = TimerTask::new(
///     WorkflowKey::new("domain", "wf", "run"),
///     TimerTaskType::ActivityTimeout,
///     OffsetDateTime::UNIX_EPOCH,
/// )
/// .with_timeout_type(TimeoutType::Heartbeat)
/// .with_event_id(5)
/// .with_version(100);
///
/// assert_eq!(task.timeout_type, Some(TimeoutType::Heartbeat));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerTask {
    /// The execution this task belongs to.
    pub workflow: WorkflowKey,
    /// Failover version of the write that created the task.
    pub version: i64,
    /// Sequence number within the cluster, assigned at persistence time.
    pub task_id: i64,
    pub task_type: TimerTaskType,
    /// Only meaningful for `ActivityTimeout` and `DecisionTimeout`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_type: Option<TimeoutType>,
    /// When the task becomes eligible to fire.
    pub visibility_timestamp: OffsetDateTime,
    /// Event the task refers to (timer started, activity/decision scheduled).
    pub event_id: i64,
    /// Activity or decision attempt the task was created for.
    pub schedule_attempt: i64,
}

impl TimerTask {
    /// Create a task of the given type with zeroed metadata.
    pub fn new(
        workflow: WorkflowKey,
        task_type: TimerTaskType,
        visibility_timestamp: OffsetDateTime,
    ) -> Self {
        Self {
            workflow,
            version: 0,
            task_id: 0,
            task_type,
            timeout_type: None,
            visibility_timestamp,
            event_id: 0,
            schedule_attempt: 0,
        }
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    pub fn with_task_id(mut self, task_id: i64) -> Self {
        self.task_id = task_id;
        self
    }

    pub fn with_timeout_type(mut self, timeout_type: TimeoutType) -> Self {
        self.timeout_type = Some(timeout_type);
        self
    }

    pub fn with_event_id(mut self, event_id: i64) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_attempt(mut self, attempt: i64) -> Self {
        self.schedule_attempt = attempt;
        self
    }
}

/// Category of an immediate (transfer) task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferTaskType {
    /// Dispatch a scheduled decision to a worker.
    DecisionTask,
    /// Dispatch a scheduled (or retried) activity to a worker.
    ActivityTask,
    /// Run close-execution bookkeeping.
    CloseExecution,
}

/// A persisted transfer task emitted by a workflow transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTask {
    pub workflow: WorkflowKey,
    pub version: i64,
    pub task_id: i64,
    pub task_type: TransferTaskType,
    /// Scheduled event of the decision or activity being dispatched.
    pub schedule_id: i64,
}
