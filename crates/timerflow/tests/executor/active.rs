//! Active execution: each task type's transition, conflicts and leases.

use anyhow::Result;
use time::Duration;
use timerflow::mutable_state::{
    ActivityOptions, ActivityRetryPolicy, TransactionPolicy, WorkflowStartOptions,
};
use timerflow::{Error, TaskOutcome, TimeoutType, TimerTaskType, TransferTaskType};

use crate::support::helpers::{
    ACTIVE_DOMAIN, CURRENT_VERSION, Harness, LOCAL_DOMAIN, complete_first_decision, event_types,
    start_options, t0,
};

#[tokio::test]
async fn user_timer_fires_and_arms_next_timer() -> Result<()> {
    let h = Harness::new();
    let mut state = h.started_workflow(LOCAL_DOMAIN, CURRENT_VERSION);
    complete_first_decision(&mut state)?;
    state.add_timer_started_event(t0(), "first", Duration::seconds(2))?;
    state.add_timer_started_event(t0(), "second", Duration::seconds(5))?;
    h.persist(&mut state, TransactionPolicy::Active).await?;
    let key = state.workflow().clone();
    let task = h.timer_task(&key, TimerTaskType::UserTimer);
    assert_eq!(task.visibility_timestamp, t0() + Duration::seconds(2));

    h.set_now(task.visibility_timestamp);
    assert_eq!(h.active().execute(&task).await?, TaskOutcome::Completed);

    let types = event_types(&h.store, &key);
    assert_eq!(
        &types[types.len() - 2..],
        ["TimerFired", "DecisionTaskScheduled"]
    );
    let mutation = h.store.mutations(&key).pop().unwrap();
    assert_eq!(mutation.delete_timers, ["first"]);
    assert_eq!(mutation.timer_tasks.len(), 1);
    assert_eq!(mutation.timer_tasks[0].task_type, TimerTaskType::UserTimer);
    assert_eq!(
        mutation.timer_tasks[0].visibility_timestamp,
        t0() + Duration::seconds(5)
    );
    Ok(())
}

#[tokio::test]
async fn canceled_timer_task_is_noop() -> Result<()> {
    let h = Harness::new();
    let mut state = h.started_workflow(LOCAL_DOMAIN, CURRENT_VERSION);
    complete_first_decision(&mut state)?;
    state.add_timer_started_event(t0(), "timer-1", Duration::seconds(2))?;
    h.persist(&mut state, TransactionPolicy::Active).await?;
    let key = state.workflow().clone();
    let task = h.timer_task(&key, TimerTaskType::UserTimer);

    state.add_timer_canceled_event(t0() + Duration::seconds(1), "timer-1")?;
    h.persist(&mut state, TransactionPolicy::Active).await?;

    h.set_now(task.visibility_timestamp);
    assert_eq!(h.active().execute(&task).await?, TaskOutcome::Completed);
    assert_eq!(h.store.mutations(&key).len(), 2);
    Ok(())
}

#[tokio::test]
async fn early_timer_delivery_is_redispatched() -> Result<()> {
    let h = Harness::new();
    let mut state = h.started_workflow(LOCAL_DOMAIN, CURRENT_VERSION);
    complete_first_decision(&mut state)?;
    state.add_timer_started_event(t0(), "timer-1", Duration::seconds(2))?;
    h.persist(&mut state, TransactionPolicy::Active).await?;
    let key = state.workflow().clone();
    let task = h.timer_task(&key, TimerTaskType::UserTimer);

    h.set_now(t0() + Duration::seconds(1));
    let active = h.active();
    assert_eq!(active.execute(&task).await?, TaskOutcome::Redispatch);
    assert_eq!(h.store.mutations(&key).len(), 1);

    h.set_now(task.visibility_timestamp);
    assert_eq!(active.execute(&task).await?, TaskOutcome::Completed);
    assert!(event_types(&h.store, &key).contains(&"TimerFired"));
    Ok(())
}

#[tokio::test]
async fn completed_activity_timeout_is_noop() -> Result<()> {
    let h = Harness::new();
    let mut state = h.started_workflow(LOCAL_DOMAIN, CURRENT_VERSION);
    complete_first_decision(&mut state)?;
    let activity = state.add_activity_task_scheduled_event(
        t0(),
        ActivityOptions {
            start_to_close_timeout: Duration::seconds(10),
            ..ActivityOptions::new("work")
        },
    )?;
    state.add_activity_task_started_event(t0(), activity.schedule_id)?;
    h.persist(&mut state, TransactionPolicy::Active).await?;
    let key = state.workflow().clone();
    let task = h.activity_task(&key, TimeoutType::StartToClose);

    state.add_activity_task_completed_event(t0() + Duration::seconds(3), activity.schedule_id)?;
    h.persist(&mut state, TransactionPolicy::Active).await?;

    h.set_now(task.visibility_timestamp);
    assert_eq!(h.active().execute(&task).await?, TaskOutcome::Completed);
    assert_eq!(h.store.mutations(&key).len(), 2);
    assert_eq!(event_types(&h.store, &key).last(), Some(&"ActivityTaskCompleted"));
    Ok(())
}

#[tokio::test]
async fn completed_decision_timeout_is_noop() -> Result<()> {
    let h = Harness::new();
    let mut state = h.started_workflow(LOCAL_DOMAIN, CURRENT_VERSION);
    let decision = state.add_decision_task_scheduled_event(t0(), None)?;
    state.add_decision_task_started_event(t0(), decision.schedule_id)?;
    h.persist(&mut state, TransactionPolicy::Active).await?;
    let key = state.workflow().clone();
    let task = h.timer_task(&key, TimerTaskType::DecisionTimeout);
    assert_eq!(task.timeout_type, Some(TimeoutType::StartToClose));

    state.add_decision_task_completed_event(t0() + Duration::seconds(1), decision.schedule_id)?;
    h.persist(&mut state, TransactionPolicy::Active).await?;

    h.set_now(task.visibility_timestamp);
    assert_eq!(h.active().execute(&task).await?, TaskOutcome::Completed);
    assert_eq!(h.store.mutations(&key).len(), 2);
    assert_eq!(event_types(&h.store, &key).last(), Some(&"DecisionTaskCompleted"));
    Ok(())
}

#[tokio::test]
async fn activity_times_out_without_retry_policy() -> Result<()> {
    let h = Harness::new();
    let mut state = h.started_workflow(LOCAL_DOMAIN, CURRENT_VERSION);
    complete_first_decision(&mut state)?;
    let activity = state.add_activity_task_scheduled_event(
        t0(),
        ActivityOptions {
            start_to_close_timeout: Duration::seconds(5),
            ..ActivityOptions::new("work")
        },
    )?;
    state.add_activity_task_started_event(t0(), activity.schedule_id)?;
    h.persist(&mut state, TransactionPolicy::Active).await?;
    let key = state.workflow().clone();
    let task = h.activity_task(&key, TimeoutType::StartToClose);

    h.set_now(task.visibility_timestamp);
    assert_eq!(h.active().execute(&task).await?, TaskOutcome::Completed);

    let types = event_types(&h.store, &key);
    assert_eq!(
        &types[types.len() - 2..],
        ["ActivityTaskTimedOut", "DecisionTaskScheduled"]
    );
    let mutation = h.store.mutations(&key).pop().unwrap();
    assert_eq!(mutation.delete_activities, [activity.schedule_id]);
    Ok(())
}

#[tokio::test]
async fn activity_retry_timer_redispatches_activity() -> Result<()> {
    let h = Harness::new();
    let mut state = h.started_workflow(LOCAL_DOMAIN, CURRENT_VERSION);
    complete_first_decision(&mut state)?;
    let activity = state.add_activity_task_scheduled_event(
        t0(),
        ActivityOptions {
            start_to_close_timeout: Duration::seconds(5),
            retry_policy: Some(ActivityRetryPolicy {
                initial_interval: Duration::seconds(1),
                backoff_coefficient: 2.0,
                maximum_interval: Duration::seconds(10),
                maximum_attempts: 3,
            }),
            ..ActivityOptions::new("work")
        },
    )?;
    state.add_activity_task_started_event(t0(), activity.schedule_id)?;
    h.persist(&mut state, TransactionPolicy::Active).await?;
    let key = state.workflow().clone();
    let timeout_task = h.activity_task(&key, TimeoutType::StartToClose);

    h.set_now(timeout_task.visibility_timestamp);
    let active = h.active();
    assert_eq!(active.execute(&timeout_task).await?, TaskOutcome::Completed);

    // Retried, not timed out: no new events and the activity is back to scheduled.
    assert_eq!(event_types(&h.store, &key).last(), Some(&"ActivityTaskStarted"));
    let retry_task = h.timer_task(&key, TimerTaskType::ActivityRetryTimer);
    assert_eq!(retry_task.event_id, activity.schedule_id);
    assert_eq!(retry_task.schedule_attempt, 1);
    assert_eq!(
        retry_task.visibility_timestamp,
        t0() + Duration::seconds(6)
    );

    h.set_now(retry_task.visibility_timestamp);
    assert_eq!(active.execute(&retry_task).await?, TaskOutcome::Completed);
    let dispatched = h
        .store
        .transfer_tasks()
        .into_iter()
        .filter(|task| {
            task.workflow == key
                && task.task_type == TransferTaskType::ActivityTask
                && task.schedule_id == activity.schedule_id
        })
        .count();
    assert_eq!(dispatched, 2);
    Ok(())
}

#[tokio::test]
async fn heartbeat_task_rearms_after_recent_heartbeat() -> Result<()> {
    let h = Harness::new();
    let mut state = h.started_workflow(LOCAL_DOMAIN, CURRENT_VERSION);
    complete_first_decision(&mut state)?;
    let activity = state.add_activity_task_scheduled_event(
        t0(),
        ActivityOptions {
            heartbeat_timeout: Duration::seconds(5),
            ..ActivityOptions::new("beating")
        },
    )?;
    state.add_activity_task_started_event(t0(), activity.schedule_id)?;
    h.persist(&mut state, TransactionPolicy::Active).await?;
    let key = state.workflow().clone();
    let task = h.activity_task(&key, TimeoutType::Heartbeat);

    state.record_activity_heartbeat(t0() + Duration::seconds(3), activity.schedule_id)?;
    h.persist(&mut state, TransactionPolicy::Active).await?;

    h.set_now(task.visibility_timestamp);
    assert_eq!(h.active().execute(&task).await?, TaskOutcome::Completed);

    assert!(!event_types(&h.store, &key).contains(&"ActivityTaskTimedOut"));
    let mutation = h.store.mutations(&key).pop().unwrap();
    assert_eq!(mutation.timer_tasks.len(), 1);
    assert_eq!(
        mutation.timer_tasks[0].visibility_timestamp,
        t0() + Duration::seconds(8)
    );
    Ok(())
}

#[tokio::test]
async fn decision_start_to_close_timeout_schedules_retry() -> Result<()> {
    let h = Harness::new();
    let mut state = h.started_workflow(LOCAL_DOMAIN, CURRENT_VERSION);
    let decision = state.add_decision_task_scheduled_event(t0(), None)?;
    state.add_decision_task_started_event(t0(), decision.schedule_id)?;
    h.persist(&mut state, TransactionPolicy::Active).await?;
    let key = state.workflow().clone();
    let task = h.timer_task(&key, TimerTaskType::DecisionTimeout);
    assert_eq!(task.timeout_type, Some(TimeoutType::StartToClose));

    h.set_now(task.visibility_timestamp);
    assert_eq!(h.active().execute(&task).await?, TaskOutcome::Completed);

    let types = event_types(&h.store, &key);
    assert_eq!(
        &types[types.len() - 2..],
        ["DecisionTaskTimedOut", "DecisionTaskScheduled"]
    );
    let mutation = h.store.mutations(&key).pop().unwrap();
    let next = mutation.decision.expect("retried decision pending");
    assert_eq!(next.attempt, 1);
    Ok(())
}

#[tokio::test]
async fn decision_task_of_other_version_is_noop_for_global_domain() -> Result<()> {
    let h = Harness::new();
    let mut state = h.started_workflow(ACTIVE_DOMAIN, CURRENT_VERSION);
    let decision = state.add_decision_task_scheduled_event(t0(), None)?;
    state.add_decision_task_started_event(t0(), decision.schedule_id)?;
    h.persist(&mut state, TransactionPolicy::Active).await?;
    let key = state.workflow().clone();
    let task = h
        .timer_task(&key, TimerTaskType::DecisionTimeout)
        .with_version(CURRENT_VERSION + 10);

    h.set_now(task.visibility_timestamp);
    assert_eq!(h.active().execute(&task).await?, TaskOutcome::Completed);
    assert_eq!(h.store.mutations(&key).len(), 1);
    Ok(())
}

#[tokio::test]
async fn backoff_timer_schedules_first_decision() -> Result<()> {
    let h = Harness::new();
    let mut state = h.new_workflow(LOCAL_DOMAIN, CURRENT_VERSION);
    state.add_workflow_execution_started_event(
        t0(),
        WorkflowStartOptions {
            first_decision_backoff: Duration::seconds(30),
            ..start_options()
        },
    )?;
    h.persist(&mut state, TransactionPolicy::Active).await?;
    let key = state.workflow().clone();
    let task = h.timer_task(&key, TimerTaskType::WorkflowBackoffTimer);

    h.set_now(task.visibility_timestamp);
    let active = h.active();
    assert_eq!(active.execute(&task).await?, TaskOutcome::Completed);
    assert_eq!(
        event_types(&h.store, &key),
        ["WorkflowExecutionStarted", "DecisionTaskScheduled"]
    );

    // Redelivery after the decision exists changes nothing.
    assert_eq!(active.execute(&task).await?, TaskOutcome::Completed);
    assert_eq!(h.store.mutations(&key).len(), 2);
    Ok(())
}

#[tokio::test]
async fn workflow_timeout_closes_execution() -> Result<()> {
    let h = Harness::new();
    let mut state = h.started_workflow(LOCAL_DOMAIN, CURRENT_VERSION);
    complete_first_decision(&mut state)?;
    state.add_timer_started_event(t0(), "late", Duration::hours(2))?;
    h.persist(&mut state, TransactionPolicy::Active).await?;
    let key = state.workflow().clone();
    let timeout_task = h.timer_task(&key, TimerTaskType::WorkflowTimeout);
    let timer_task = h.timer_task(&key, TimerTaskType::UserTimer);

    h.set_now(timeout_task.visibility_timestamp);
    let active = h.active();
    assert_eq!(active.execute(&timeout_task).await?, TaskOutcome::Completed);
    assert_eq!(
        event_types(&h.store, &key).last(),
        Some(&"WorkflowExecutionTimedOut")
    );
    assert!(h.store.transfer_tasks().iter().any(|task| {
        task.workflow == key && task.task_type == TransferTaskType::CloseExecution
    }));

    // Tasks of a closed execution are already handled.
    h.set_now(timer_task.visibility_timestamp);
    assert_eq!(active.execute(&timer_task).await?, TaskOutcome::Completed);
    assert_eq!(h.store.mutations(&key).len(), 2);
    Ok(())
}

#[tokio::test]
async fn workflow_timeout_after_close_is_noop() -> Result<()> {
    let h = Harness::new();
    let mut state = h.started_workflow(LOCAL_DOMAIN, CURRENT_VERSION);
    complete_first_decision(&mut state)?;
    h.persist(&mut state, TransactionPolicy::Active).await?;
    let key = state.workflow().clone();
    let task = h.timer_task(&key, TimerTaskType::WorkflowTimeout);

    let completed_id = state
        .execution_info()
        .last_processed_event
        .expect("decision completed");
    state.add_workflow_execution_completed_event(t0() + Duration::seconds(1), completed_id)?;
    h.persist(&mut state, TransactionPolicy::Active).await?;

    h.set_now(task.visibility_timestamp);
    assert_eq!(h.active().execute(&task).await?, TaskOutcome::Completed);
    assert_eq!(h.store.mutations(&key).len(), 2);
    assert!(!event_types(&h.store, &key).contains(&"WorkflowExecutionTimedOut"));
    Ok(())
}

#[tokio::test]
async fn early_workflow_timeout_is_redispatched() -> Result<()> {
    let h = Harness::new();
    let mut state = h.started_workflow(LOCAL_DOMAIN, CURRENT_VERSION);
    complete_first_decision(&mut state)?;
    h.persist(&mut state, TransactionPolicy::Active).await?;
    let key = state.workflow().clone();
    let task = h.timer_task(&key, TimerTaskType::WorkflowTimeout);

    h.set_now(task.visibility_timestamp - Duration::minutes(5));
    let active = h.active();
    assert_eq!(active.execute(&task).await?, TaskOutcome::Redispatch);
    assert_eq!(h.store.mutations(&key).len(), 1);

    h.set_now(task.visibility_timestamp);
    assert_eq!(active.execute(&task).await?, TaskOutcome::Completed);
    assert_eq!(
        event_types(&h.store, &key).last(),
        Some(&"WorkflowExecutionTimedOut")
    );
    Ok(())
}

#[tokio::test]
async fn write_conflict_reloads_and_retries() -> Result<()> {
    let h = Harness::new();
    let mut state = h.started_workflow(LOCAL_DOMAIN, CURRENT_VERSION);
    complete_first_decision(&mut state)?;
    state.add_timer_started_event(t0(), "timer-1", Duration::seconds(2))?;
    h.persist(&mut state, TransactionPolicy::Active).await?;
    let key = state.workflow().clone();
    let task = h.timer_task(&key, TimerTaskType::UserTimer);

    h.set_now(task.visibility_timestamp);
    h.store.inject_condition_failures(2);
    assert_eq!(h.active().execute(&task).await?, TaskOutcome::Completed);

    let fired = event_types(&h.store, &key)
        .into_iter()
        .filter(|event_type| *event_type == "TimerFired")
        .count();
    assert_eq!(fired, 1);
    Ok(())
}

#[tokio::test]
async fn write_conflicts_exhaust_attempts() -> Result<()> {
    let h = Harness::new();
    let mut state = h.started_workflow(LOCAL_DOMAIN, CURRENT_VERSION);
    complete_first_decision(&mut state)?;
    state.add_timer_started_event(t0(), "timer-1", Duration::seconds(2))?;
    h.persist(&mut state, TransactionPolicy::Active).await?;
    let key = state.workflow().clone();
    let task = h.timer_task(&key, TimerTaskType::UserTimer);

    h.set_now(task.visibility_timestamp);
    h.store.inject_condition_failures(3);
    let err = h.active().execute(&task).await.unwrap_err();
    assert!(matches!(err, Error::ConditionFailed { .. }));
    assert!(err.is_retryable());
    assert!(!event_types(&h.store, &key).contains(&"TimerFired"));

    // The lease was released and the cache dropped: a redelivery succeeds.
    assert_eq!(h.active().execute(&task).await?, TaskOutcome::Completed);
    Ok(())
}

#[tokio::test]
async fn held_lease_times_out() -> Result<()> {
    let h = Harness::new();
    let mut state = h.started_workflow(LOCAL_DOMAIN, CURRENT_VERSION);
    h.persist(&mut state, TransactionPolicy::Active).await?;
    let key = state.workflow().clone();
    let task = h.timer_task(&key, TimerTaskType::WorkflowTimeout);

    let _lease = h.cache.acquire(&key, h.config.lease_timeout).await?;
    let err = h.active().execute(&task).await.unwrap_err();
    assert!(matches!(err, Error::LeaseTimeout(_)));
    Ok(())
}
