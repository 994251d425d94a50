//! History events written by mutable state transitions.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::task::TimeoutType;

/// One committed history event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub event_id: i64,
    /// Failover version of the cluster that wrote the event.
    pub version: i64,
    pub timestamp: OffsetDateTime,
    pub attributes: EventAttributes,
}

/// Event payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventAttributes {
    WorkflowExecutionStarted {
        execution_timeout: Duration,
        decision_start_to_close_timeout: Duration,
        first_decision_backoff: Duration,
    },
    DecisionTaskScheduled {
        attempt: i64,
        start_to_close_timeout: Duration,
    },
    DecisionTaskStarted {
        scheduled_event_id: i64,
    },
    DecisionTaskCompleted {
        scheduled_event_id: i64,
        started_event_id: i64,
    },
    DecisionTaskTimedOut {
        scheduled_event_id: i64,
        started_event_id: Option<i64>,
        timeout_type: TimeoutType,
    },
    TimerStarted {
        timer_id: String,
        start_to_fire_timeout: Duration,
    },
    TimerFired {
        timer_id: String,
        started_event_id: i64,
    },
    TimerCanceled {
        timer_id: String,
        started_event_id: i64,
    },
    ActivityTaskScheduled {
        activity_id: String,
        schedule_to_start_timeout: Duration,
        schedule_to_close_timeout: Duration,
        start_to_close_timeout: Duration,
        heartbeat_timeout: Duration,
    },
    ActivityTaskStarted {
        scheduled_event_id: i64,
        attempt: i64,
    },
    ActivityTaskCompleted {
        scheduled_event_id: i64,
        started_event_id: i64,
    },
    ActivityTaskTimedOut {
        scheduled_event_id: i64,
        started_event_id: Option<i64>,
        timeout_type: TimeoutType,
    },
    WorkflowExecutionCompleted {
        decision_task_completed_event_id: i64,
    },
    WorkflowExecutionTimedOut,
}

impl EventAttributes {
    /// Tag used in logs and serialized payloads.
    pub fn event_type(&self) -> &'static str {
        match self {
            EventAttributes::WorkflowExecutionStarted { .. } => "WorkflowExecutionStarted",
            EventAttributes::DecisionTaskScheduled { .. } => "DecisionTaskScheduled",
            EventAttributes::DecisionTaskStarted { .. } => "DecisionTaskStarted",
            EventAttributes::DecisionTaskCompleted { .. } => "DecisionTaskCompleted",
            EventAttributes::DecisionTaskTimedOut { .. } => "DecisionTaskTimedOut",
            EventAttributes::TimerStarted { .. } => "TimerStarted",
            EventAttributes::TimerFired { .. } => "TimerFired",
            EventAttributes::TimerCanceled { .. } => "TimerCanceled",
            EventAttributes::ActivityTaskScheduled { .. } => "ActivityTaskScheduled",
            EventAttributes::ActivityTaskStarted { .. } => "ActivityTaskStarted",
            EventAttributes::ActivityTaskCompleted { .. } => "ActivityTaskCompleted",
            EventAttributes::ActivityTaskTimedOut { .. } => "ActivityTaskTimedOut",
            EventAttributes::WorkflowExecutionCompleted { .. } => "WorkflowExecutionCompleted",
            EventAttributes::WorkflowExecutionTimedOut => "WorkflowExecutionTimedOut",
        }
    }
}
