//! Per-task-type evaluation.
//!
//! [`due_transitions`] is read-only and shared by both modes: it reports what a
//! task would do against the loaded state, judged at a reference time (now for
//! active, the task's visibility for standby). An empty result means the task
//! refers to something already resolved. [`apply_transitions`] performs them,
//! which only the active mode does.

use std::collections::BTreeSet;

use time::OffsetDateTime;

use crate::error::{Error, Result};
use crate::mutable_state::{MutableState, TimerTaskStatus};
use crate::task::{TimeoutType, TimerTask, TimerTaskType};
use crate::timer_sequence::{TimerSequence, load_and_sort_activity_timers, load_and_sort_user_timers};

/// A state change a timer task makes due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Transition {
    FireUserTimer { timer_id: String },
    TimeoutActivity { schedule_id: i64, timeout_type: TimeoutType },
    TimeoutDecision { schedule_id: i64, timeout_type: TimeoutType },
    ScheduleFirstDecision,
    TimeoutWorkflow,
    DispatchActivity { schedule_id: i64 },
}

pub(crate) fn due_transitions(
    state: &MutableState,
    task: &TimerTask,
    reference: OffsetDateTime,
    verify_version: bool,
) -> Result<Vec<Transition>> {
    match task.task_type {
        TimerTaskType::UserTimer => Ok(due_user_timers(state, reference)),
        TimerTaskType::ActivityTimeout => due_activity_timeouts(state, task, reference),
        TimerTaskType::DecisionTimeout => due_decision_timeout(state, task, verify_version),
        TimerTaskType::WorkflowBackoffTimer => {
            if !version_matches(verify_version, state.execution_info().start_version, task)
                || state.has_processed_or_pending_decision()
            {
                return Ok(Vec::new());
            }
            Ok(vec![Transition::ScheduleFirstDecision])
        }
        TimerTaskType::WorkflowTimeout => {
            let info = state.execution_info();
            if !version_matches(verify_version, info.start_version, task)
                || info.expiration_time.is_some_and(|expiry| reference < expiry)
            {
                return Ok(Vec::new());
            }
            Ok(vec![Transition::TimeoutWorkflow])
        }
        TimerTaskType::ActivityRetryTimer => {
            let Some(activity) = state.activity(task.event_id) else {
                return Ok(Vec::new());
            };
            if activity.attempt != task.schedule_attempt
                || activity.is_started()
                || !version_matches(verify_version, activity.version, task)
            {
                return Ok(Vec::new());
            }
            Ok(vec![Transition::DispatchActivity {
                schedule_id: activity.schedule_id,
            }])
        }
    }
}

fn version_matches(verify: bool, recorded: i64, task: &TimerTask) -> bool {
    !verify || recorded == task.version
}

fn due_user_timers(state: &MutableState, reference: OffsetDateTime) -> Vec<Transition> {
    let mut due = Vec::new();
    for timer in load_and_sort_user_timers(state) {
        let Some(info) = state.timer_by_started_id(timer.event_id) else {
            continue;
        };
        if !timer.is_expired(reference) {
            break;
        }
        due.push(Transition::FireUserTimer {
            timer_id: info.timer_id.clone(),
        });
    }
    due
}

fn due_activity_timeouts(
    state: &MutableState,
    task: &TimerTask,
    reference: OffsetDateTime,
) -> Result<Vec<Transition>> {
    let timeout_type = task
        .timeout_type
        .ok_or_else(|| Error::internal("activity timeout task without timeout type"))?;
    if timeout_type == TimeoutType::Heartbeat
        && state
            .activity(task.event_id)
            .and_then(|activity| activity.last_heartbeat_time)
            .is_some_and(|beat| beat > task.visibility_timestamp)
    {
        return Ok(Vec::new());
    }
    // Issued for an earlier attempt; the retry re-armed its own timers.
    if state
        .activity(task.event_id)
        .is_some_and(|activity| task.schedule_attempt < activity.attempt)
    {
        return Ok(Vec::new());
    }

    let mut seen = BTreeSet::new();
    let mut due = Vec::new();
    for timer in load_and_sort_activity_timers(state) {
        if seen.contains(&timer.event_id) {
            continue;
        }
        if !timer.is_expired(reference) {
            break;
        }
        seen.insert(timer.event_id);
        due.push(Transition::TimeoutActivity {
            schedule_id: timer.event_id,
            timeout_type: timer.timer_type,
        });
    }
    Ok(due)
}

fn due_decision_timeout(
    state: &MutableState,
    task: &TimerTask,
    verify_version: bool,
) -> Result<Vec<Transition>> {
    let timeout_type = task
        .timeout_type
        .ok_or_else(|| Error::internal("decision timeout task without timeout type"))?;
    let Some(decision) = state.decision(task.event_id) else {
        return Ok(Vec::new());
    };
    if !version_matches(verify_version, decision.version, task)
        || decision.attempt != task.schedule_attempt
    {
        return Ok(Vec::new());
    }
    let pending = match timeout_type {
        TimeoutType::StartToClose => decision.started_id.is_some(),
        TimeoutType::ScheduleToStart => decision.started_id.is_none(),
        other => {
            return Err(Error::internal(format!(
                "decision timeout task with timeout type {other:?}"
            )));
        }
    };
    if !pending {
        return Ok(Vec::new());
    }
    Ok(vec![Transition::TimeoutDecision {
        schedule_id: decision.schedule_id,
        timeout_type,
    }])
}

/// Whether a task with nothing due was delivered ahead of its visibility
/// timestamp while the timer it stands for is still pending. Such a task must
/// come back later, since no other task will fire that timer.
pub(crate) fn awaits_expiry(
    state: &MutableState,
    task: &TimerTask,
    reference: OffsetDateTime,
    verify_version: bool,
) -> bool {
    if reference >= task.visibility_timestamp {
        return false;
    }
    match task.task_type {
        TimerTaskType::UserTimer => load_and_sort_user_timers(state)
            .iter()
            .any(|timer| timer.created && !timer.is_expired(reference)),
        TimerTaskType::ActivityTimeout => state
            .activity(task.event_id)
            .is_some_and(|activity| activity.attempt == task.schedule_attempt),
        TimerTaskType::WorkflowTimeout => {
            version_matches(verify_version, state.execution_info().start_version, task)
        }
        TimerTaskType::DecisionTimeout
        | TimerTaskType::WorkflowBackoffTimer
        | TimerTaskType::ActivityRetryTimer => false,
    }
}

/// Perform due transitions, then schedule a decision if any of them calls
/// for one and none is pending.
pub(crate) fn apply_transitions(
    state: &mut MutableState,
    transitions: &[Transition],
    now: OffsetDateTime,
) -> Result<()> {
    let mut schedule_decision = false;
    for transition in transitions {
        match transition {
            Transition::FireUserTimer { timer_id } => {
                state.add_timer_fired_event(now, timer_id)?;
                schedule_decision = true;
            }
            Transition::TimeoutActivity {
                schedule_id,
                timeout_type,
            } => {
                if !state.retry_activity(now, *schedule_id, *timeout_type)? {
                    state.add_activity_task_timed_out_event(now, *schedule_id, *timeout_type)?;
                    schedule_decision = true;
                }
            }
            Transition::TimeoutDecision {
                schedule_id,
                timeout_type,
            } => {
                match timeout_type {
                    TimeoutType::ScheduleToStart => {
                        state.add_decision_task_schedule_to_start_timeout_event(now, *schedule_id)?
                    }
                    _ => state.add_decision_task_timed_out_event(now, *schedule_id)?,
                };
                schedule_decision = true;
            }
            Transition::ScheduleFirstDecision => {
                if !state.has_pending_decision() {
                    state.add_decision_task_scheduled_event(now, None)?;
                }
            }
            Transition::TimeoutWorkflow => {
                state.add_timeout_workflow_event(now)?;
            }
            Transition::DispatchActivity { schedule_id } => {
                state.dispatch_activity(*schedule_id)?;
            }
        }
    }
    if schedule_decision && state.is_running() && !state.has_pending_decision() {
        state.add_decision_task_scheduled_event(now, None)?;
    }
    Ok(())
}

/// Clear the heartbeat flag of the activity a heartbeat task refers to, unless
/// a later heartbeat task has already been emitted for it.
pub(crate) fn clear_heartbeat_timer(state: &mut MutableState, task: &TimerTask) -> bool {
    if task.task_type != TimerTaskType::ActivityTimeout
        || task.timeout_type != Some(TimeoutType::Heartbeat)
    {
        return false;
    }
    let Some(activity) = state.activity(task.event_id) else {
        return false;
    };
    if !activity
        .timer_task_status
        .contains(TimerTaskStatus::CREATED_HEARTBEAT)
        || activity
            .last_heartbeat_timeout_visibility
            .is_some_and(|visibility| visibility > task.visibility_timestamp)
    {
        return false;
    }
    match state.activity_mut(task.event_id) {
        Some(activity) => {
            activity
                .timer_task_status
                .remove(TimerTaskStatus::CREATED_HEARTBEAT);
            true
        }
        None => false,
    }
}

/// Re-arm activity timers after an ActivityTimeout task turned out to be a
/// no-op. Returns whether the state changed.
pub(crate) fn refresh_activity_timers(state: &mut MutableState, task: &TimerTask) -> Result<bool> {
    let cleared = clear_heartbeat_timer(state, task);
    let created = TimerSequence::new(state).create_next_activity_timer()?;
    Ok(cleared || created)
}
