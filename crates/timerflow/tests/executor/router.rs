//! Mode selection by domain and failover version.

use anyhow::Result;
use time::Duration;
use timerflow::mutable_state::TransactionPolicy;
use timerflow::{Error, TaskOutcome, TimerTask, TimerTaskType, WorkflowKey};

use crate::support::helpers::{
    ACTIVE_DOMAIN, CURRENT_VERSION, GLOBAL_DOMAIN, Harness, LOCAL_DOMAIN, REMOTE_CLUSTER,
    REMOTE_VERSION, complete_first_decision, event_types, t0,
};

async fn timer_due(h: &Harness, domain: &str, version: i64) -> Result<TimerTask> {
    let mut state = h.started_workflow(domain, version);
    complete_first_decision(&mut state)?;
    state.add_timer_started_event(t0(), "timer-1", Duration::seconds(2))?;
    h.persist(&mut state, TransactionPolicy::Active).await?;
    let task = h.timer_task(state.workflow(), TimerTaskType::UserTimer);
    h.set_now(task.visibility_timestamp);
    Ok(task)
}

#[tokio::test]
async fn local_and_locally_active_domains_run_active() -> Result<()> {
    let h = Harness::new();
    let router = h.router();

    for domain in [LOCAL_DOMAIN, ACTIVE_DOMAIN] {
        let task = timer_due(&h, domain, CURRENT_VERSION).await?;
        assert_eq!(router.execute(&task).await?, TaskOutcome::Completed);
        assert!(event_types(&h.store, &task.workflow).contains(&"TimerFired"));
    }
    Ok(())
}

#[tokio::test]
async fn remotely_active_domain_runs_standby() -> Result<()> {
    let h = Harness::new();
    let router = h.router();
    assert!(router.standby(REMOTE_CLUSTER).is_some());

    let task = timer_due(&h, GLOBAL_DOMAIN, REMOTE_VERSION).await?;
    assert_eq!(router.execute(&task).await?, TaskOutcome::Redispatch);
    assert!(!event_types(&h.store, &task.workflow).contains(&"TimerFired"));
    Ok(())
}

#[tokio::test]
async fn failover_moves_tasks_between_modes() -> Result<()> {
    let h = Harness::new();
    let router = h.router();
    let task = timer_due(&h, GLOBAL_DOMAIN, REMOTE_VERSION).await?;
    assert_eq!(router.execute(&task).await?, TaskOutcome::Redispatch);

    h.metadata.failover(GLOBAL_DOMAIN, "east");
    assert_eq!(router.execute(&task).await?, TaskOutcome::Completed);
    assert!(event_types(&h.store, &task.workflow).contains(&"TimerFired"));
    Ok(())
}

#[tokio::test]
async fn unknown_failover_version_is_rejected() -> Result<()> {
    let h = Harness::new();
    let task = TimerTask::new(
        WorkflowKey::new(GLOBAL_DOMAIN, "w", "r"),
        TimerTaskType::UserTimer,
        t0(),
    )
    .with_version(15);

    let err = h.router().execute(&task).await.unwrap_err();
    assert!(matches!(err, Error::UnknownCluster(_)));
    Ok(())
}

#[tokio::test]
async fn unknown_domain_is_a_store_error() -> Result<()> {
    let h = Harness::new();
    let task = TimerTask::new(
        WorkflowKey::new("no-such-domain", "w", "r"),
        TimerTaskType::UserTimer,
        t0(),
    );

    let err = h.router().execute(&task).await.unwrap_err();
    assert!(matches!(err, Error::Store(_)));
    assert!(err.is_retryable());
    Ok(())
}
