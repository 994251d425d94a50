//! Timer sequence: deterministic recomputation of user and activity timers.
//!
//! Every pending user timer and every eligible activity timeout is a candidate
//! [`TimerSequenceId`]. Candidates are sorted by `(timestamp, timeout priority,
//! event id)` and only the earliest one is ever materialized as a persisted
//! task. Creation is recorded on the item itself (`TimerInfo::task_created`,
//! `ActivityInfo::timer_task_status`), so recomputing against unchanged state
//! finds the earliest candidate already created and adds nothing.
//!
//! Activity timeout candidates per activity:
//!
//! | Timeout | Eligible when | Fires at |
//! |---------|---------------|----------|
//! | ScheduleToStart | not started | scheduled + timeout |
//! | ScheduleToClose | always | scheduled + timeout |
//! | StartToClose | started | started + timeout |
//! | Heartbeat | started | max(started, last heartbeat) + timeout |
//!
//! A zero timeout disables its candidate.

use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::error::{Error, Result};
use crate::mutable_state::{ActivityInfo, MutableState, TimerTaskStatus};
use crate::task::{TimeoutType, TimerTask, TimerTaskType};

/// One candidate timer.
///
/// User timers carry [`TimeoutType::StartToClose`] as their timer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSequenceId {
    /// Timer started event id, or activity scheduled event id.
    pub event_id: i64,
    pub timestamp: OffsetDateTime,
    pub timer_type: TimeoutType,
    /// Whether a persisted task already exists for this candidate.
    pub created: bool,
    /// Activity attempt the candidate was computed for; zero for user timers.
    pub attempt: i64,
}

impl TimerSequenceId {
    /// Whether the timer is due at `reference`.
    pub fn is_expired(&self, reference: OffsetDateTime) -> bool {
        reference >= self.timestamp
    }

    fn sort_key(&self) -> (OffsetDateTime, u8, i64) {
        (self.timestamp, self.timer_type.priority(), self.event_id)
    }
}

/// All pending user timers, earliest first.
pub fn load_and_sort_user_timers(state: &MutableState) -> Vec<TimerSequenceId> {
    let mut timers: Vec<_> = state
        .pending_timers()
        .values()
        .map(|timer| TimerSequenceId {
            event_id: timer.started_id,
            timestamp: timer.expiry_time,
            timer_type: TimeoutType::StartToClose,
            created: timer.task_created,
            attempt: 0,
        })
        .collect();
    timers.sort_by_key(TimerSequenceId::sort_key);
    timers
}

/// All eligible activity timeouts across pending activities, earliest first.
pub fn load_and_sort_activity_timers(state: &MutableState) -> Vec<TimerSequenceId> {
    let mut timers: Vec<_> = state
        .pending_activities()
        .values()
        .flat_map(activity_timers)
        .collect();
    timers.sort_by_key(TimerSequenceId::sort_key);
    timers
}

fn activity_timers(activity: &ActivityInfo) -> Vec<TimerSequenceId> {
    let candidate = |timer_type: TimeoutType, base: OffsetDateTime, timeout: Duration| {
        timeout.is_positive().then(|| TimerSequenceId {
            event_id: activity.schedule_id,
            timestamp: base + timeout,
            timer_type,
            created: activity
                .timer_task_status
                .contains(TimerTaskStatus::for_timeout(timer_type)),
            attempt: activity.attempt,
        })
    };

    let mut timers = Vec::with_capacity(4);
    match activity.started_time {
        None => timers.extend(candidate(
            TimeoutType::ScheduleToStart,
            activity.scheduled_time,
            activity.schedule_to_start_timeout,
        )),
        Some(started) => {
            timers.extend(candidate(
                TimeoutType::StartToClose,
                started,
                activity.start_to_close_timeout,
            ));
            let last_beat = activity
                .last_heartbeat_time
                .map_or(started, |beat| beat.max(started));
            timers.extend(candidate(
                TimeoutType::Heartbeat,
                last_beat,
                activity.heartbeat_timeout,
            ));
        }
    }
    timers.extend(candidate(
        TimeoutType::ScheduleToClose,
        activity.scheduled_time,
        activity.schedule_to_close_timeout,
    ));
    timers
}

/// Emits the next user or activity timer task into a state's buffer.
pub struct TimerSequence<'a> {
    state: &'a mut MutableState,
}

impl<'a> TimerSequence<'a> {
    pub fn new(state: &'a mut MutableState) -> Self {
        Self { state }
    }

    /// Buffer a UserTimer task for the earliest pending timer if it has none.
    ///
    /// Returns whether a task was added.
    pub fn create_next_user_timer(&mut self) -> Result<bool> {
        let Some(first) = load_and_sort_user_timers(self.state).into_iter().next() else {
            return Ok(false);
        };
        if first.created {
            return Ok(false);
        }

        let timer_id = self
            .state
            .timer_by_started_id(first.event_id)
            .map(|timer| timer.timer_id.clone())
            .ok_or_else(|| Error::internal(format!("timer started by {} vanished", first.event_id)))?;
        if let Some(timer) = self.state.timer_mut(&timer_id) {
            timer.task_created = true;
        }

        let task = TimerTask::new(
            self.state.workflow().clone(),
            TimerTaskType::UserTimer,
            first.timestamp,
        )
        .with_version(self.state.current_version())
        .with_event_id(first.event_id);
        debug!(
            workflow = %self.state.workflow(),
            timer_id = %timer_id,
            visibility = %first.timestamp,
            "Created user timer task"
        );
        self.state.push_timer_task(task);
        Ok(true)
    }

    /// Buffer an ActivityTimeout task for the earliest eligible activity
    /// timeout if it has none.
    ///
    /// Returns whether a task was added.
    pub fn create_next_activity_timer(&mut self) -> Result<bool> {
        let Some(first) = load_and_sort_activity_timers(self.state).into_iter().next() else {
            return Ok(false);
        };
        if first.created {
            return Ok(false);
        }

        let activity = self
            .state
            .activity_mut(first.event_id)
            .ok_or_else(|| Error::internal(format!("activity {} vanished", first.event_id)))?;
        activity
            .timer_task_status
            .insert(TimerTaskStatus::for_timeout(first.timer_type));
        if first.timer_type == TimeoutType::Heartbeat {
            activity.last_heartbeat_timeout_visibility = Some(first.timestamp);
        }

        let task = TimerTask::new(
            self.state.workflow().clone(),
            TimerTaskType::ActivityTimeout,
            first.timestamp,
        )
        .with_version(self.state.current_version())
        .with_timeout_type(first.timer_type)
        .with_event_id(first.event_id)
        .with_attempt(first.attempt);
        debug!(
            workflow = %self.state.workflow(),
            schedule_id = first.event_id,
            timeout_type = ?first.timer_type,
            visibility = %first.timestamp,
            "Created activity timeout task"
        );
        self.state.push_timer_task(task);
        Ok(true)
    }
}
