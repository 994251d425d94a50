//! Mutable state: the working copy of one execution's progress.
//!
//! A [`MutableState`] is loaded from a [`WorkflowSnapshot`], mutated by event
//! adders while the execution lease is held, and flushed as a
//! [`WorkflowMutation`] by [`MutableState::close_transaction`]. Adders append a
//! history event (stamped with the current failover version and recorded in
//! the current version-history branch), update the pending maps, and buffer the
//! timer and transfer tasks the transition implies.
//!
//! User and activity timer tasks are not emitted by adders; they are recomputed
//! by the [`TimerSequence`](crate::TimerSequence) when an active transaction
//! closes.
//!
//! # Example
//!
//! ```
//! use time::{Duration, OffsetDateTime};
//! use timerflow::mutable_state::{MutableState, TransactionPolicy, WorkflowStartOptions};
//! use timerflow::{TimerTaskType, WorkflowKey};
//!
//! let now = OffsetDateTime::UNIX_EPOCH;
//! let mut state = MutableState::new(WorkflowKey::new("d", "w", "r"), 100, now);
//! state.add_workflow_execution_started_event(now, WorkflowStartOptions {
//!     execution_timeout: Duration::hours(1),
//!     decision_start_to_close_timeout: Duration::seconds(10),
//!     first_decision_backoff: Duration::ZERO,
//! })?;
//! state.add_timer_started_event(now, "t1", Duration::seconds(2))?;
//!
//! let mutation = state.close_transaction(TransactionPolicy::Active)?;
//! let types: Vec<_> = mutation.timer_tasks.iter().map(|t| t.task_type).collect();
//! assert_eq!(types, [TimerTaskType::WorkflowTimeout, TimerTaskType::UserTimer]);
//! # Ok::<(), timerflow::Error>(())
//! ```

mod events;
mod info;
mod snapshot;
mod version_history;

use std::collections::{BTreeMap, BTreeSet};

use time::{Duration, OffsetDateTime};
use tracing::debug;

pub use events::{EventAttributes, HistoryEvent};
pub use info::{
    ActivityInfo, ActivityRetryPolicy, CloseStatus, DecisionInfo, ExecutionInfo, ExecutionState,
    TimerInfo, TimerTaskStatus,
};
pub use snapshot::{WorkflowMutation, WorkflowSnapshot};
pub use version_history::{VersionHistories, VersionHistory, VersionHistoryItem};

use crate::error::{Error, Result};
use crate::task::{TimeoutType, TimerTask, TimerTaskType, TransferTask, TransferTaskType};
use crate::timer_sequence::TimerSequence;
use crate::workflow::WorkflowKey;

/// How a transaction is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPolicy {
    /// Regenerate user and activity timer tasks before flushing.
    Active,
    /// Flush as-is; the caller already produced any timer tasks it needs.
    Passive,
}

/// Parameters of a workflow start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkflowStartOptions {
    pub execution_timeout: Duration,
    pub decision_start_to_close_timeout: Duration,
    pub first_decision_backoff: Duration,
}

/// Parameters of an activity schedule. Zero timeouts are disabled.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityOptions {
    pub activity_id: String,
    pub schedule_to_start_timeout: Duration,
    pub schedule_to_close_timeout: Duration,
    pub start_to_close_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub retry_policy: Option<ActivityRetryPolicy>,
}

impl ActivityOptions {
    /// Options with every timeout disabled and no retry policy.
    pub fn new(activity_id: impl Into<String>) -> Self {
        Self {
            activity_id: activity_id.into(),
            schedule_to_start_timeout: Duration::ZERO,
            schedule_to_close_timeout: Duration::ZERO,
            start_to_close_timeout: Duration::ZERO,
            heartbeat_timeout: Duration::ZERO,
            retry_policy: None,
        }
    }

    /// Options with all four timeouts set to `timeout`.
    pub fn uniform(activity_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            schedule_to_start_timeout: timeout,
            schedule_to_close_timeout: timeout,
            start_to_close_timeout: timeout,
            heartbeat_timeout: timeout,
            ..Self::new(activity_id)
        }
    }
}

/// Working copy of one execution.
#[derive(Debug, Clone)]
pub struct MutableState {
    execution_info: ExecutionInfo,
    version_histories: VersionHistories,
    pending_activities: BTreeMap<i64, ActivityInfo>,
    pending_timers: BTreeMap<String, TimerInfo>,
    pending_decision: Option<DecisionInfo>,
    current_version: i64,
    db_version: i64,

    updated_activities: BTreeSet<i64>,
    deleted_activities: BTreeSet<i64>,
    updated_timers: BTreeSet<String>,
    deleted_timers: BTreeSet<String>,
    new_events: Vec<HistoryEvent>,
    timer_tasks: Vec<TimerTask>,
    transfer_tasks: Vec<TransferTask>,
}

impl MutableState {
    /// A brand-new execution that has not been started yet.
    pub fn new(workflow: WorkflowKey, current_version: i64, now: OffsetDateTime) -> Self {
        let execution_info = ExecutionInfo {
            workflow,
            state: ExecutionState::Created,
            close_status: None,
            start_time: now,
            expiration_time: None,
            execution_timeout: Duration::ZERO,
            decision_start_to_close_timeout: Duration::ZERO,
            first_decision_backoff: Duration::ZERO,
            start_version: current_version,
            last_processed_event: None,
            decision_attempt: 0,
            next_event_id: 1,
            last_updated: now,
        };
        Self::restore(
            execution_info,
            VersionHistories::new(VersionHistory::default()),
            BTreeMap::new(),
            BTreeMap::new(),
            None,
            current_version,
            0,
        )
    }

    /// Rebuild from a persisted snapshot with empty buffers.
    pub fn from_snapshot(snapshot: WorkflowSnapshot) -> Self {
        Self::restore(
            snapshot.execution_info,
            snapshot.version_histories,
            snapshot.activities,
            snapshot.timers,
            snapshot.decision,
            snapshot.current_version,
            snapshot.db_version,
        )
    }

    fn restore(
        execution_info: ExecutionInfo,
        version_histories: VersionHistories,
        pending_activities: BTreeMap<i64, ActivityInfo>,
        pending_timers: BTreeMap<String, TimerInfo>,
        pending_decision: Option<DecisionInfo>,
        current_version: i64,
        db_version: i64,
    ) -> Self {
        Self {
            execution_info,
            version_histories,
            pending_activities,
            pending_timers,
            pending_decision,
            current_version,
            db_version,
            updated_activities: BTreeSet::new(),
            deleted_activities: BTreeSet::new(),
            updated_timers: BTreeSet::new(),
            deleted_timers: BTreeSet::new(),
            new_events: Vec::new(),
            timer_tasks: Vec::new(),
            transfer_tasks: Vec::new(),
        }
    }

    /// Persisted view of the state, excluding unflushed buffers.
    pub fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            execution_info: self.execution_info.clone(),
            version_histories: self.version_histories.clone(),
            activities: self.pending_activities.clone(),
            timers: self.pending_timers.clone(),
            decision: self.pending_decision.clone(),
            current_version: self.current_version,
            db_version: self.db_version,
        }
    }

    pub fn workflow(&self) -> &WorkflowKey {
        &self.execution_info.workflow
    }

    pub fn execution_info(&self) -> &ExecutionInfo {
        &self.execution_info
    }

    pub fn version_histories(&self) -> &VersionHistories {
        &self.version_histories
    }

    pub fn next_event_id(&self) -> i64 {
        self.execution_info.next_event_id
    }

    pub fn current_version(&self) -> i64 {
        self.current_version
    }

    /// Set the failover version stamped on subsequent events.
    pub fn set_current_version(&mut self, version: i64) {
        self.current_version = version;
    }

    pub fn db_version(&self) -> i64 {
        self.db_version
    }

    pub fn is_running(&self) -> bool {
        self.execution_info.state == ExecutionState::Running
    }

    /// Version of the last event in the current branch.
    pub fn last_write_version(&self) -> Result<i64> {
        Ok(self.version_histories.current().last_item()?.version)
    }

    pub fn pending_activities(&self) -> &BTreeMap<i64, ActivityInfo> {
        &self.pending_activities
    }

    pub fn pending_timers(&self) -> &BTreeMap<String, TimerInfo> {
        &self.pending_timers
    }

    pub fn activity(&self, schedule_id: i64) -> Option<&ActivityInfo> {
        self.pending_activities.get(&schedule_id)
    }

    pub fn timer(&self, timer_id: &str) -> Option<&TimerInfo> {
        self.pending_timers.get(timer_id)
    }

    pub fn timer_by_started_id(&self, started_id: i64) -> Option<&TimerInfo> {
        self.pending_timers
            .values()
            .find(|timer| timer.started_id == started_id)
    }

    pub fn pending_decision(&self) -> Option<&DecisionInfo> {
        self.pending_decision.as_ref()
    }

    /// The pending decision if it was scheduled by `schedule_id`.
    pub fn decision(&self, schedule_id: i64) -> Option<&DecisionInfo> {
        self.pending_decision
            .as_ref()
            .filter(|decision| decision.schedule_id == schedule_id)
    }

    pub fn has_pending_decision(&self) -> bool {
        self.pending_decision.is_some()
    }

    pub fn has_processed_or_pending_decision(&self) -> bool {
        self.pending_decision.is_some() || self.execution_info.last_processed_event.is_some()
    }

    /// Events appended since the last flush.
    pub fn new_events(&self) -> &[HistoryEvent] {
        &self.new_events
    }

    /// Timer tasks buffered since the last flush.
    pub fn timer_tasks(&self) -> &[TimerTask] {
        &self.timer_tasks
    }

    pub fn transfer_tasks(&self) -> &[TransferTask] {
        &self.transfer_tasks
    }

    /// Drop buffered timer tasks without touching the per-item status that
    /// recorded their creation.
    pub fn delete_timer_tasks(&mut self) {
        self.timer_tasks.clear();
    }

    pub(crate) fn push_timer_task(&mut self, task: TimerTask) {
        self.timer_tasks.push(task);
    }

    pub(crate) fn activity_mut(&mut self, schedule_id: i64) -> Option<&mut ActivityInfo> {
        let activity = self.pending_activities.get_mut(&schedule_id)?;
        self.updated_activities.insert(schedule_id);
        Some(activity)
    }

    pub(crate) fn timer_mut(&mut self, timer_id: &str) -> Option<&mut TimerInfo> {
        let timer = self.pending_timers.get_mut(timer_id)?;
        self.updated_timers.insert(timer_id.to_string());
        Some(timer)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::internal(format!(
                "workflow {} is not running",
                self.execution_info.workflow
            )))
        }
    }

    fn add_event(&mut self, now: OffsetDateTime, attributes: EventAttributes) -> Result<HistoryEvent> {
        let event = HistoryEvent {
            event_id: self.execution_info.next_event_id,
            version: self.current_version,
            timestamp: now,
            attributes,
        };
        self.version_histories
            .current_mut()
            .add_or_update_item(VersionHistoryItem::new(event.event_id, event.version))?;
        self.execution_info.next_event_id += 1;
        self.execution_info.last_updated = now;
        debug!(
            workflow = %self.execution_info.workflow,
            event_id = event.event_id,
            event_type = event.attributes.event_type(),
            "Appended history event"
        );
        self.new_events.push(event.clone());
        Ok(event)
    }

    fn new_timer_task(&self, task_type: TimerTaskType, visibility: OffsetDateTime) -> TimerTask {
        TimerTask::new(self.execution_info.workflow.clone(), task_type, visibility)
            .with_version(self.current_version)
    }

    fn push_transfer_task(&mut self, task_type: TransferTaskType, schedule_id: i64) {
        self.transfer_tasks.push(TransferTask {
            workflow: self.execution_info.workflow.clone(),
            version: self.current_version,
            task_id: 0,
            task_type,
            schedule_id,
        });
    }

    pub fn add_workflow_execution_started_event(
        &mut self,
        now: OffsetDateTime,
        options: WorkflowStartOptions,
    ) -> Result<HistoryEvent> {
        if self.execution_info.state != ExecutionState::Created {
            return Err(Error::internal(format!(
                "workflow {} already started",
                self.execution_info.workflow
            )));
        }
        let event = self.add_event(
            now,
            EventAttributes::WorkflowExecutionStarted {
                execution_timeout: options.execution_timeout,
                decision_start_to_close_timeout: options.decision_start_to_close_timeout,
                first_decision_backoff: options.first_decision_backoff,
            },
        )?;

        let info = &mut self.execution_info;
        info.state = ExecutionState::Running;
        info.start_time = now;
        info.execution_timeout = options.execution_timeout;
        info.decision_start_to_close_timeout = options.decision_start_to_close_timeout;
        info.first_decision_backoff = options.first_decision_backoff;
        info.start_version = self.current_version;

        let first_decision_at = now + options.first_decision_backoff;
        if options.first_decision_backoff.is_positive() {
            let task = self
                .new_timer_task(TimerTaskType::WorkflowBackoffTimer, first_decision_at)
                .with_event_id(event.event_id);
            self.timer_tasks.push(task);
        }
        if options.execution_timeout.is_positive() {
            let expiration = first_decision_at + options.execution_timeout;
            self.execution_info.expiration_time = Some(expiration);
            let task = self
                .new_timer_task(TimerTaskType::WorkflowTimeout, expiration)
                .with_event_id(event.event_id);
            self.timer_tasks.push(task);
        }
        Ok(event)
    }

    /// Schedule a decision. A `schedule_to_start_timeout` marks it sticky.
    pub fn add_decision_task_scheduled_event(
        &mut self,
        now: OffsetDateTime,
        schedule_to_start_timeout: Option<Duration>,
    ) -> Result<DecisionInfo> {
        self.ensure_running()?;
        if let Some(pending) = &self.pending_decision {
            return Err(Error::internal(format!(
                "decision {} is already pending",
                pending.schedule_id
            )));
        }
        let attempt = self.execution_info.decision_attempt;
        let start_to_close_timeout = self.execution_info.decision_start_to_close_timeout;
        let event = self.add_event(
            now,
            EventAttributes::DecisionTaskScheduled {
                attempt,
                start_to_close_timeout,
            },
        )?;
        let decision = DecisionInfo {
            version: self.current_version,
            schedule_id: event.event_id,
            started_id: None,
            attempt,
            scheduled_time: now,
            started_time: None,
            start_to_close_timeout,
            schedule_to_start_timeout,
        };
        if let Some(timeout) = schedule_to_start_timeout {
            let task = self
                .new_timer_task(TimerTaskType::DecisionTimeout, now + timeout)
                .with_timeout_type(TimeoutType::ScheduleToStart)
                .with_event_id(decision.schedule_id)
                .with_attempt(attempt);
            self.timer_tasks.push(task);
        }
        self.push_transfer_task(TransferTaskType::DecisionTask, decision.schedule_id);
        self.pending_decision = Some(decision.clone());
        Ok(decision)
    }

    pub fn add_decision_task_started_event(
        &mut self,
        now: OffsetDateTime,
        schedule_id: i64,
    ) -> Result<DecisionInfo> {
        self.ensure_running()?;
        let mut decision = self
            .decision(schedule_id)
            .filter(|decision| decision.started_id.is_none())
            .cloned()
            .ok_or_else(|| Error::internal(format!("no startable decision {schedule_id}")))?;
        let event = self.add_event(
            now,
            EventAttributes::DecisionTaskStarted {
                scheduled_event_id: schedule_id,
            },
        )?;
        decision.started_id = Some(event.event_id);
        decision.started_time = Some(now);
        let task = self
            .new_timer_task(
                TimerTaskType::DecisionTimeout,
                now + decision.start_to_close_timeout,
            )
            .with_timeout_type(TimeoutType::StartToClose)
            .with_event_id(schedule_id)
            .with_attempt(decision.attempt);
        self.timer_tasks.push(task);
        self.pending_decision = Some(decision.clone());
        Ok(decision)
    }

    fn started_decision(&self, schedule_id: i64) -> Result<(i64, &DecisionInfo)> {
        self.decision(schedule_id)
            .and_then(|decision| decision.started_id.map(|started| (started, decision)))
            .ok_or_else(|| Error::internal(format!("decision {schedule_id} is not started")))
    }

    pub fn add_decision_task_completed_event(
        &mut self,
        now: OffsetDateTime,
        schedule_id: i64,
    ) -> Result<HistoryEvent> {
        self.ensure_running()?;
        let (started_event_id, _) = self.started_decision(schedule_id)?;
        let event = self.add_event(
            now,
            EventAttributes::DecisionTaskCompleted {
                scheduled_event_id: schedule_id,
                started_event_id,
            },
        )?;
        self.pending_decision = None;
        self.execution_info.last_processed_event = Some(event.event_id);
        self.execution_info.decision_attempt = 0;
        Ok(event)
    }

    /// Start-to-close timeout of a started decision. The next decision is a retry.
    pub fn add_decision_task_timed_out_event(
        &mut self,
        now: OffsetDateTime,
        schedule_id: i64,
    ) -> Result<HistoryEvent> {
        self.ensure_running()?;
        let (started_event_id, _) = self.started_decision(schedule_id)?;
        let event = self.add_event(
            now,
            EventAttributes::DecisionTaskTimedOut {
                scheduled_event_id: schedule_id,
                started_event_id: Some(started_event_id),
                timeout_type: TimeoutType::StartToClose,
            },
        )?;
        self.pending_decision = None;
        self.execution_info.decision_attempt += 1;
        Ok(event)
    }

    /// Schedule-to-start timeout of a sticky decision that was never picked up.
    pub fn add_decision_task_schedule_to_start_timeout_event(
        &mut self,
        now: OffsetDateTime,
        schedule_id: i64,
    ) -> Result<HistoryEvent> {
        self.ensure_running()?;
        if self
            .decision(schedule_id)
            .is_none_or(|decision| decision.started_id.is_some())
        {
            return Err(Error::internal(format!(
                "decision {schedule_id} is not waiting to start"
            )));
        }
        let event = self.add_event(
            now,
            EventAttributes::DecisionTaskTimedOut {
                scheduled_event_id: schedule_id,
                started_event_id: None,
                timeout_type: TimeoutType::ScheduleToStart,
            },
        )?;
        self.pending_decision = None;
        Ok(event)
    }

    pub fn add_timer_started_event(
        &mut self,
        now: OffsetDateTime,
        timer_id: impl Into<String>,
        start_to_fire_timeout: Duration,
    ) -> Result<TimerInfo> {
        self.ensure_running()?;
        let timer_id = timer_id.into();
        if self.pending_timers.contains_key(&timer_id) {
            return Err(Error::internal(format!("timer {timer_id} already pending")));
        }
        let event = self.add_event(
            now,
            EventAttributes::TimerStarted {
                timer_id: timer_id.clone(),
                start_to_fire_timeout,
            },
        )?;
        let timer = TimerInfo {
            timer_id: timer_id.clone(),
            started_id: event.event_id,
            expiry_time: now + start_to_fire_timeout,
            version: self.current_version,
            task_created: false,
        };
        self.pending_timers.insert(timer_id.clone(), timer.clone());
        self.deleted_timers.remove(&timer_id);
        self.updated_timers.insert(timer_id);
        Ok(timer)
    }

    pub fn add_timer_fired_event(&mut self, now: OffsetDateTime, timer_id: &str) -> Result<HistoryEvent> {
        self.ensure_running()?;
        let started_event_id = self.pending_timer_started_id(timer_id)?;
        let event = self.add_event(
            now,
            EventAttributes::TimerFired {
                timer_id: timer_id.to_string(),
                started_event_id,
            },
        )?;
        self.delete_timer(timer_id);
        Ok(event)
    }

    pub fn add_timer_canceled_event(
        &mut self,
        now: OffsetDateTime,
        timer_id: &str,
    ) -> Result<HistoryEvent> {
        self.ensure_running()?;
        let started_event_id = self.pending_timer_started_id(timer_id)?;
        let event = self.add_event(
            now,
            EventAttributes::TimerCanceled {
                timer_id: timer_id.to_string(),
                started_event_id,
            },
        )?;
        self.delete_timer(timer_id);
        Ok(event)
    }

    fn pending_timer_started_id(&self, timer_id: &str) -> Result<i64> {
        self.pending_timers
            .get(timer_id)
            .map(|timer| timer.started_id)
            .ok_or_else(|| Error::internal(format!("timer {timer_id} is not pending")))
    }

    fn delete_timer(&mut self, timer_id: &str) {
        self.pending_timers.remove(timer_id);
        self.updated_timers.remove(timer_id);
        self.deleted_timers.insert(timer_id.to_string());
    }

    pub fn add_activity_task_scheduled_event(
        &mut self,
        now: OffsetDateTime,
        options: ActivityOptions,
    ) -> Result<ActivityInfo> {
        self.ensure_running()?;
        let event = self.add_event(
            now,
            EventAttributes::ActivityTaskScheduled {
                activity_id: options.activity_id.clone(),
                schedule_to_start_timeout: options.schedule_to_start_timeout,
                schedule_to_close_timeout: options.schedule_to_close_timeout,
                start_to_close_timeout: options.start_to_close_timeout,
                heartbeat_timeout: options.heartbeat_timeout,
            },
        )?;
        let activity = ActivityInfo {
            version: self.current_version,
            schedule_id: event.event_id,
            scheduled_time: now,
            started_id: None,
            started_time: None,
            activity_id: options.activity_id,
            schedule_to_start_timeout: options.schedule_to_start_timeout,
            schedule_to_close_timeout: options.schedule_to_close_timeout,
            start_to_close_timeout: options.start_to_close_timeout,
            heartbeat_timeout: options.heartbeat_timeout,
            last_heartbeat_time: None,
            last_heartbeat_timeout_visibility: None,
            timer_task_status: TimerTaskStatus::NONE,
            attempt: 0,
            retry_policy: options.retry_policy,
        };
        self.pending_activities
            .insert(activity.schedule_id, activity.clone());
        self.updated_activities.insert(activity.schedule_id);
        self.push_transfer_task(TransferTaskType::ActivityTask, activity.schedule_id);
        Ok(activity)
    }

    pub fn add_activity_task_started_event(
        &mut self,
        now: OffsetDateTime,
        schedule_id: i64,
    ) -> Result<ActivityInfo> {
        self.ensure_running()?;
        let attempt = match self.activity(schedule_id) {
            Some(activity) if !activity.is_started() => activity.attempt,
            _ => {
                return Err(Error::internal(format!(
                    "no startable activity {schedule_id}"
                )));
            }
        };
        let event = self.add_event(
            now,
            EventAttributes::ActivityTaskStarted {
                scheduled_event_id: schedule_id,
                attempt,
            },
        )?;
        let activity = self
            .activity_mut(schedule_id)
            .ok_or_else(|| Error::internal(format!("activity {schedule_id} vanished")))?;
        activity.started_id = Some(event.event_id);
        activity.started_time = Some(now);
        Ok(activity.clone())
    }

    /// Record a heartbeat. Heartbeats do not produce history events.
    pub fn record_activity_heartbeat(&mut self, now: OffsetDateTime, schedule_id: i64) -> Result<()> {
        self.ensure_running()?;
        let activity = self
            .activity_mut(schedule_id)
            .filter(|activity| activity.is_started())
            .ok_or_else(|| Error::internal(format!("activity {schedule_id} is not running")))?;
        activity.last_heartbeat_time = Some(now);
        Ok(())
    }

    pub fn add_activity_task_completed_event(
        &mut self,
        now: OffsetDateTime,
        schedule_id: i64,
    ) -> Result<HistoryEvent> {
        self.ensure_running()?;
        let started_event_id = self
            .activity(schedule_id)
            .and_then(|activity| activity.started_id)
            .ok_or_else(|| Error::internal(format!("activity {schedule_id} is not running")))?;
        let event = self.add_event(
            now,
            EventAttributes::ActivityTaskCompleted {
                scheduled_event_id: schedule_id,
                started_event_id,
            },
        )?;
        self.delete_activity(schedule_id);
        Ok(event)
    }

    pub fn add_activity_task_timed_out_event(
        &mut self,
        now: OffsetDateTime,
        schedule_id: i64,
        timeout_type: TimeoutType,
    ) -> Result<HistoryEvent> {
        self.ensure_running()?;
        let started_event_id = self
            .activity(schedule_id)
            .map(|activity| activity.started_id)
            .ok_or_else(|| Error::internal(format!("activity {schedule_id} is not pending")))?;
        let event = self.add_event(
            now,
            EventAttributes::ActivityTaskTimedOut {
                scheduled_event_id: schedule_id,
                started_event_id,
                timeout_type,
            },
        )?;
        self.delete_activity(schedule_id);
        Ok(event)
    }

    fn delete_activity(&mut self, schedule_id: i64) {
        self.pending_activities.remove(&schedule_id);
        self.updated_activities.remove(&schedule_id);
        self.deleted_activities.insert(schedule_id);
    }

    /// Reschedule an activity after a timeout if its retry policy allows.
    ///
    /// ScheduleToStart timeouts are never retried. On retry the activity goes
    /// back to scheduled at `now + backoff` with a fresh attempt and an
    /// ActivityRetryTimer task; returns `false` when the caller should time
    /// the activity out instead.
    pub fn retry_activity(
        &mut self,
        now: OffsetDateTime,
        schedule_id: i64,
        timeout_type: TimeoutType,
    ) -> Result<bool> {
        if timeout_type == TimeoutType::ScheduleToStart {
            return Ok(false);
        }
        let Some(activity) = self.activity(schedule_id) else {
            return Err(Error::internal(format!(
                "activity {schedule_id} is not pending"
            )));
        };
        let Some(backoff) = activity
            .retry_policy
            .as_ref()
            .and_then(|policy| policy.next_backoff(activity.attempt))
        else {
            return Ok(false);
        };

        let version = self.current_version;
        let activity = self
            .activity_mut(schedule_id)
            .ok_or_else(|| Error::internal(format!("activity {schedule_id} vanished")))?;
        activity.version = version;
        activity.attempt += 1;
        activity.scheduled_time = now + backoff;
        activity.started_id = None;
        activity.started_time = None;
        activity.last_heartbeat_time = None;
        activity.last_heartbeat_timeout_visibility = None;
        activity.timer_task_status = TimerTaskStatus::NONE;
        let (scheduled_time, attempt) = (activity.scheduled_time, activity.attempt);

        let task = self
            .new_timer_task(TimerTaskType::ActivityRetryTimer, scheduled_time)
            .with_event_id(schedule_id)
            .with_attempt(attempt);
        self.timer_tasks.push(task);
        Ok(true)
    }

    /// Hand a retried activity back to workers.
    pub fn dispatch_activity(&mut self, schedule_id: i64) -> Result<()> {
        self.ensure_running()?;
        if self.activity(schedule_id).is_none() {
            return Err(Error::internal(format!(
                "activity {schedule_id} is not pending"
            )));
        }
        self.push_transfer_task(TransferTaskType::ActivityTask, schedule_id);
        Ok(())
    }

    pub fn add_workflow_execution_completed_event(
        &mut self,
        now: OffsetDateTime,
        decision_task_completed_event_id: i64,
    ) -> Result<HistoryEvent> {
        self.ensure_running()?;
        let event = self.add_event(
            now,
            EventAttributes::WorkflowExecutionCompleted {
                decision_task_completed_event_id,
            },
        )?;
        self.close(CloseStatus::Completed, event.event_id);
        Ok(event)
    }

    pub fn add_timeout_workflow_event(&mut self, now: OffsetDateTime) -> Result<HistoryEvent> {
        self.ensure_running()?;
        let event = self.add_event(now, EventAttributes::WorkflowExecutionTimedOut)?;
        self.close(CloseStatus::TimedOut, event.event_id);
        Ok(event)
    }

    fn close(&mut self, status: CloseStatus, event_id: i64) {
        self.execution_info.state = ExecutionState::Completed;
        self.execution_info.close_status = Some(status);
        self.push_transfer_task(TransferTaskType::CloseExecution, event_id);
    }

    /// Drain buffered changes into a mutation and bump the db version.
    pub fn close_transaction(&mut self, policy: TransactionPolicy) -> Result<WorkflowMutation> {
        if policy == TransactionPolicy::Active && self.is_running() {
            let mut sequence = TimerSequence::new(self);
            sequence.create_next_user_timer()?;
            sequence.create_next_activity_timer()?;
        }

        let upsert_activities = std::mem::take(&mut self.updated_activities)
            .into_iter()
            .filter_map(|id| self.pending_activities.get(&id).cloned())
            .collect();
        let upsert_timers = std::mem::take(&mut self.updated_timers)
            .into_iter()
            .filter_map(|id| self.pending_timers.get(&id).cloned())
            .collect();
        self.db_version += 1;

        Ok(WorkflowMutation {
            execution_info: self.execution_info.clone(),
            version_histories: self.version_histories.clone(),
            upsert_activities,
            delete_activities: std::mem::take(&mut self.deleted_activities)
                .into_iter()
                .collect(),
            upsert_timers,
            delete_timers: std::mem::take(&mut self.deleted_timers).into_iter().collect(),
            decision: self.pending_decision.clone(),
            current_version: self.current_version,
            new_events: std::mem::take(&mut self.new_events),
            timer_tasks: std::mem::take(&mut self.timer_tasks),
            transfer_tasks: std::mem::take(&mut self.transfer_tasks),
            db_version: self.db_version,
        })
    }
}
