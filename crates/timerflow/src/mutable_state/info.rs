//! Persisted records for pending work inside one execution.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::task::TimeoutType;
use crate::workflow::WorkflowKey;

/// Which activity timeout categories already have an outstanding timer task.
///
/// # Example
///
/// ```
/// use timerflow::TimeoutType;
/// use timerflow::mutable_state::TimerTaskStatus;
///
/// let mut status = TimerTaskStatus::NONE;
/// status.insert(TimerTaskStatus::for_timeout(TimeoutType::Heartbeat));
///
/// assert!(status.contains(TimerTaskStatus::CREATED_HEARTBEAT));
/// assert!(!status.contains(TimerTaskStatus::CREATED_START_TO_CLOSE));
/// ```
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimerTaskStatus(u8);

impl TimerTaskStatus {
    pub const NONE: Self = Self(0);
    pub const CREATED_START_TO_CLOSE: Self = Self(1);
    pub const CREATED_SCHEDULE_TO_START: Self = Self(1 << 1);
    pub const CREATED_SCHEDULE_TO_CLOSE: Self = Self(1 << 2);
    pub const CREATED_HEARTBEAT: Self = Self(1 << 3);

    /// The flag recording a task for `timeout_type`.
    pub const fn for_timeout(timeout_type: TimeoutType) -> Self {
        match timeout_type {
            TimeoutType::StartToClose => Self::CREATED_START_TO_CLOSE,
            TimeoutType::ScheduleToStart => Self::CREATED_SCHEDULE_TO_START,
            TimeoutType::ScheduleToClose => Self::CREATED_SCHEDULE_TO_CLOSE,
            TimeoutType::Heartbeat => Self::CREATED_HEARTBEAT,
        }
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl std::fmt::Debug for TimerTaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut set = f.debug_set();
        for timeout_type in TimeoutType::ALL {
            if self.contains(Self::for_timeout(timeout_type)) {
                set.entry(&timeout_type);
            }
        }
        set.finish()
    }
}

/// Lifecycle of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionState {
    Created,
    Running,
    Completed,
}

/// How a completed execution closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseStatus {
    Completed,
    TimedOut,
}

/// Execution-wide fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub workflow: WorkflowKey,
    pub state: ExecutionState,
    pub close_status: Option<CloseStatus>,
    pub start_time: OffsetDateTime,
    /// Absolute workflow timeout, set by the started event.
    pub expiration_time: Option<OffsetDateTime>,
    pub execution_timeout: Duration,
    pub decision_start_to_close_timeout: Duration,
    /// Delay before the first decision is scheduled (cron and retry starts).
    pub first_decision_backoff: Duration,
    /// Failover version of the started event.
    pub start_version: i64,
    /// Event id of the last completed decision.
    pub last_processed_event: Option<i64>,
    /// Attempt number for the next scheduled decision.
    pub decision_attempt: i64,
    pub next_event_id: i64,
    pub last_updated: OffsetDateTime,
}

/// A pending user timer, keyed by its user-supplied id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerInfo {
    pub timer_id: String,
    /// Event id of the timer started event.
    pub started_id: i64,
    pub expiry_time: OffsetDateTime,
    pub version: i64,
    /// Whether a UserTimer task for this timer has been emitted.
    pub task_created: bool,
}

/// Retry settings carried by an activity.
///
/// # Example
///
/// ```
/// use time::Duration;
/// use timerflow::mutable_state::ActivityRetryPolicy;
///
/// let policy = ActivityRetryPolicy {
///     initial_interval: Duration::seconds(1),
///     backoff_coefficient: 2.0,
///     maximum_interval: Duration::seconds(10),
///     maximum_attempts: 3,
/// };
///
/// assert_eq!(policy.next_backoff(0), Some(Duration::seconds(1)));
/// assert_eq!(policy.next_backoff(1), Some(Duration::seconds(2)));
/// assert_eq!(policy.next_backoff(2), None);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    /// Zero means uncapped.
    pub maximum_interval: Duration,
    /// Total attempts including the first. Zero means unlimited.
    pub maximum_attempts: i64,
}

impl ActivityRetryPolicy {
    /// Delay before the next attempt, given the attempt that just failed
    /// (0-based). `None` once attempts are exhausted.
    pub fn next_backoff(&self, attempt: i64) -> Option<Duration> {
        if self.maximum_attempts > 0 && attempt + 1 >= self.maximum_attempts {
            return None;
        }
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.backoff_coefficient.max(1.0).powi(exponent);
        let mut seconds = self.initial_interval.as_seconds_f64() * factor;
        if self.maximum_interval.is_positive() {
            seconds = seconds.min(self.maximum_interval.as_seconds_f64());
        }
        if !seconds.is_finite() || seconds >= i64::MAX as f64 {
            return None;
        }
        Some(Duration::seconds_f64(seconds))
    }
}

/// A pending activity, keyed by its scheduled event id.
///
/// Timeouts of zero are disabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityInfo {
    pub version: i64,
    pub schedule_id: i64,
    pub scheduled_time: OffsetDateTime,
    pub started_id: Option<i64>,
    pub started_time: Option<OffsetDateTime>,
    pub activity_id: String,
    pub schedule_to_start_timeout: Duration,
    pub schedule_to_close_timeout: Duration,
    pub start_to_close_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub last_heartbeat_time: Option<OffsetDateTime>,
    /// Visibility of the last emitted Heartbeat timeout task.
    pub last_heartbeat_timeout_visibility: Option<OffsetDateTime>,
    pub timer_task_status: TimerTaskStatus,
    pub attempt: i64,
    pub retry_policy: Option<ActivityRetryPolicy>,
}

impl ActivityInfo {
    pub fn is_started(&self) -> bool {
        self.started_id.is_some()
    }
}

/// The single outstanding decision of an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionInfo {
    pub version: i64,
    pub schedule_id: i64,
    pub started_id: Option<i64>,
    pub attempt: i64,
    pub scheduled_time: OffsetDateTime,
    pub started_time: Option<OffsetDateTime>,
    pub start_to_close_timeout: Duration,
    /// Only set for sticky decisions.
    pub schedule_to_start_timeout: Option<Duration>,
}
