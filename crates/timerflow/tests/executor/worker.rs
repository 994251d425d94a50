//! Timer runtime over the in-memory queue.

use std::time::Duration as StdDuration;

use anyhow::Result;
use time::Duration;
use timerflow::mutable_state::TransactionPolicy;
use timerflow::runtime::{RetryPolicy, RuntimeConfig, TimerRuntime};
use timerflow::store::MemoryStore;
use timerflow::{TimerTask, TimerTaskType};

use crate::support::helpers::{
    CURRENT_VERSION, GLOBAL_DOMAIN, Harness, LOCAL_DOMAIN, REMOTE_VERSION, RESEND_DELAY,
    complete_first_decision, event_types, t0,
};

const REDISPATCH_DELAY: StdDuration = StdDuration::from_secs(5);

fn test_runtime_config() -> RuntimeConfig {
    RuntimeConfig {
        timer_poll_interval: StdDuration::from_millis(20),
        attempt_timeout: StdDuration::from_secs(5),
        redispatch_delay: REDISPATCH_DELAY,
        shutdown_timeout: StdDuration::from_secs(5),
        retry_policy: RetryPolicy {
            max_attempts: 3,
            base_delay: StdDuration::from_secs(1),
            max_delay: StdDuration::from_secs(60),
        },
        worker_id: Some("test-worker".into()),
        ..Default::default()
    }
}

fn runtime(h: &Harness) -> TimerRuntime<MemoryStore, MemoryStore> {
    TimerRuntime::new(h.router(), h.store.clone(), test_runtime_config())
}

async fn timer_started(h: &Harness, domain: &str, version: i64) -> Result<TimerTask> {
    let mut state = h.started_workflow(domain, version);
    complete_first_decision(&mut state)?;
    state.add_timer_started_event(t0(), "timer-1", Duration::seconds(2))?;
    h.persist(&mut state, TransactionPolicy::Active).await?;
    Ok(h.timer_task(state.workflow(), TimerTaskType::UserTimer))
}

#[tokio::test]
async fn due_timer_is_fired_and_removed() -> Result<()> {
    let h = Harness::new();
    let runtime = runtime(&h);
    let task = timer_started(&h, LOCAL_DOMAIN, CURRENT_VERSION).await?;

    assert!(!runtime.process_one().await?);

    h.set_now(task.visibility_timestamp);
    assert!(runtime.process_one().await?);
    assert!(event_types(&h.store, &task.workflow).contains(&"TimerFired"));
    assert!(
        h.store
            .pending_timer_tasks(&task.workflow)
            .iter()
            .all(|pending| pending.task_id != task.task_id)
    );
    Ok(())
}

#[tokio::test]
async fn redispatched_task_returns_after_delay() -> Result<()> {
    let h = Harness::new();
    let runtime = runtime(&h);
    let task = timer_started(&h, GLOBAL_DOMAIN, REMOTE_VERSION).await?;

    h.set_now(task.visibility_timestamp);
    assert!(runtime.process_one().await?);
    assert!(!runtime.process_one().await?);
    assert!(
        h.store
            .pending_timer_tasks(&task.workflow)
            .iter()
            .any(|pending| pending.task_id == task.task_id)
    );

    h.set_now(task.visibility_timestamp + Duration::try_from(REDISPATCH_DELAY)?);
    assert!(runtime.process_one().await?);
    assert!(h.store.last_error(task.task_id).is_none());
    Ok(())
}

#[tokio::test]
async fn failed_resend_is_recorded_for_retry() -> Result<()> {
    let h = Harness::new();
    let runtime = runtime(&h);
    let task = timer_started(&h, GLOBAL_DOMAIN, REMOTE_VERSION).await?;

    h.resender.fail_requests(true);
    h.set_now(task.visibility_timestamp + RESEND_DELAY);
    assert!(runtime.process_one().await?);

    let error = h.store.last_error(task.task_id).expect("failure recorded");
    assert!(error.contains("history resend failed"), "{error}");

    // First failure backs off by the base delay. Decision timers due by now
    // complete without a resend.
    h.set_now(task.visibility_timestamp + RESEND_DELAY + Duration::seconds(1));
    h.resender.fail_requests(false);
    while runtime.process_one().await? {}
    assert_eq!(h.resender.calls().len(), 2);
    assert!(
        h.store
            .pending_timer_tasks(&task.workflow)
            .iter()
            .any(|pending| pending.task_id == task.task_id)
    );
    Ok(())
}

#[tokio::test]
async fn discarded_task_is_removed() -> Result<()> {
    let h = Harness::new();
    let runtime = runtime(&h);
    let task = timer_started(&h, GLOBAL_DOMAIN, REMOTE_VERSION).await?;

    h.set_now(task.visibility_timestamp + Duration::hours(1));
    assert!(runtime.process_one().await?);
    assert!(
        h.store
            .pending_timer_tasks(&task.workflow)
            .iter()
            .all(|pending| pending.task_id != task.task_id)
    );
    assert!(h.resender.calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn run_processes_tasks_until_shutdown() -> Result<()> {
    let h = Harness::new();
    let runtime = runtime(&h);
    let task = timer_started(&h, LOCAL_DOMAIN, CURRENT_VERSION).await?;
    h.set_now(task.visibility_timestamp);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let handle = tokio::spawn(runtime.run(async {
        let _ = shutdown_rx.await;
    }));

    let deadline = tokio::time::Instant::now() + StdDuration::from_secs(5);
    while !event_types(&h.store, &task.workflow).contains(&"TimerFired") {
        assert!(tokio::time::Instant::now() < deadline, "timer never fired");
        tokio::time::sleep(StdDuration::from_millis(20)).await;
    }

    let _ = shutdown_tx.send(());
    handle.await??;
    Ok(())
}
