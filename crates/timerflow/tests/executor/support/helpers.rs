use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use time::macros::datetime;
use time::{Duration, OffsetDateTime};
use timerflow::clock::{ManualTimeSource, ShardClock};
use timerflow::mutable_state::{MutableState, TransactionPolicy, WorkflowStartOptions};
use timerflow::store::{ExecutionStore, HistoryResender, MemoryStore, StaticClusterMetadata};
use timerflow::{
    ActiveGuard, ExecutionCache, ExecutorConfig, StandbyGuard, TimeoutType, TimerTask,
    TimerTaskExecutor, TimerTaskRouter, TimerTaskType, WorkflowKey,
};
use uuid::Uuid;

pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("timerflow=debug")
        .try_init();
}

pub const CURRENT_CLUSTER: &str = "east";
pub const REMOTE_CLUSTER: &str = "west";
pub const GLOBAL_DOMAIN: &str = "global-domain";
pub const LOCAL_DOMAIN: &str = "local-domain";
pub const ACTIVE_DOMAIN: &str = "active-domain";

/// Failover versions owned by each cluster (increment 10).
pub const CURRENT_VERSION: i64 = 11;
pub const REMOTE_VERSION: i64 = 12;

pub const RESEND_DELAY: Duration = Duration::minutes(15);
pub const DISCARD_DELAY: Duration = Duration::minutes(25);

pub fn t0() -> OffsetDateTime {
    datetime!(2024-05-01 12:00 UTC)
}

pub fn start_options() -> WorkflowStartOptions {
    WorkflowStartOptions {
        execution_timeout: Duration::hours(1),
        decision_start_to_close_timeout: Duration::seconds(10),
        first_decision_backoff: Duration::ZERO,
    }
}

/// History resender that records every request.
#[derive(Default)]
pub struct RecordingResender {
    calls: Mutex<Vec<(WorkflowKey, i64, i64)>>,
    fail: AtomicBool,
}

impl RecordingResender {
    pub fn calls(&self) -> Vec<(WorkflowKey, i64, i64)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_requests(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl HistoryResender for RecordingResender {
    async fn send_single_workflow_history(
        &self,
        workflow: &WorkflowKey,
        from_event_id: i64,
        from_version: i64,
    ) -> timerflow::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((workflow.clone(), from_event_id, from_version));
        if self.fail.load(Ordering::SeqCst) {
            return Err(timerflow::Error::store("remote cluster unavailable"));
        }
        Ok(())
    }
}

/// One shard in the current cluster, with a manual clock and in-memory store.
pub struct Harness {
    pub store: MemoryStore,
    pub time: Arc<ManualTimeSource>,
    pub clock: Arc<ShardClock>,
    pub metadata: Arc<StaticClusterMetadata>,
    pub resender: Arc<RecordingResender>,
    pub cache: Arc<ExecutionCache>,
    pub config: ExecutorConfig,
}

impl Harness {
    pub fn new() -> Self {
        init_test_tracing();
        let time = Arc::new(ManualTimeSource::new(t0()));
        let metadata = StaticClusterMetadata::new(CURRENT_CLUSTER, 10)
            .with_cluster(CURRENT_CLUSTER, 1)
            .with_cluster(REMOTE_CLUSTER, 2)
            .with_global_domain(GLOBAL_DOMAIN, REMOTE_CLUSTER)
            .with_global_domain(ACTIVE_DOMAIN, CURRENT_CLUSTER)
            .with_local_domain(LOCAL_DOMAIN);
        Self {
            store: MemoryStore::with_time_source(time.clone()),
            clock: Arc::new(ShardClock::new(CURRENT_CLUSTER, time.clone())),
            time,
            metadata: Arc::new(metadata),
            resender: Arc::new(RecordingResender::default()),
            cache: Arc::new(ExecutionCache::new()),
            config: ExecutorConfig {
                resend_delay: RESEND_DELAY.unsigned_abs(),
                discard_delay: DISCARD_DELAY.unsigned_abs(),
                lease_timeout: std::time::Duration::from_millis(100),
                ..Default::default()
            },
        }
    }

    pub fn active(&self) -> TimerTaskExecutor<MemoryStore, ActiveGuard> {
        TimerTaskExecutor::new(
            self.store.clone(),
            self.cache.clone(),
            self.clock.clone(),
            self.metadata.clone(),
            ActiveGuard::new(CURRENT_CLUSTER),
            self.config.clone(),
        )
        .unwrap()
    }

    pub fn standby(&self) -> TimerTaskExecutor<MemoryStore, StandbyGuard> {
        TimerTaskExecutor::new(
            self.store.clone(),
            self.cache.clone(),
            self.clock.clone(),
            self.metadata.clone(),
            StandbyGuard::new(REMOTE_CLUSTER, self.resender.clone(), &self.config),
            self.config.clone(),
        )
        .unwrap()
    }

    pub fn router(&self) -> TimerTaskRouter<MemoryStore> {
        TimerTaskRouter::new(
            self.store.clone(),
            self.clock.clone(),
            self.metadata.clone(),
            self.resender.clone(),
            self.config.clone(),
            [REMOTE_CLUSTER],
        )
        .unwrap()
    }

    /// Set the local time, and the remote cluster's time as seen through replication.
    pub fn set_now(&self, now: OffsetDateTime) {
        self.time.update(now);
        self.clock.set_current_time(REMOTE_CLUSTER, now);
    }

    /// An execution in `domain` that has not started yet.
    pub fn new_workflow(&self, domain: &str, version: i64) -> MutableState {
        let key = WorkflowKey::new(domain, "timer-workflow", Uuid::new_v4().to_string());
        MutableState::new(key, version, t0())
    }

    /// A started execution in `domain`, not yet persisted.
    pub fn started_workflow(&self, domain: &str, version: i64) -> MutableState {
        let mut state = self.new_workflow(domain, version);
        state
            .add_workflow_execution_started_event(t0(), start_options())
            .unwrap();
        state
    }

    /// Write the state's pending changes to the store, as the active cluster
    /// (or replication, with `Passive`) would. The write happens under the
    /// execution lease and drops the cached copy.
    pub async fn persist(&self, state: &mut MutableState, policy: TransactionPolicy) -> Result<()> {
        let mut context = self
            .cache
            .acquire(state.workflow(), self.config.lease_timeout)
            .await?;
        self.persist_uncached(state, policy).await?;
        context.clear();
        Ok(())
    }

    /// Write to the store without touching the execution cache.
    pub async fn persist_uncached(
        &self,
        state: &mut MutableState,
        policy: TransactionPolicy,
    ) -> Result<()> {
        let expected = state.db_version();
        let mutation = state.close_transaction(policy)?;
        self.store.update_mutable_state(mutation, expected).await?;
        Ok(())
    }

    pub fn timer_task(&self, workflow: &WorkflowKey, task_type: TimerTaskType) -> TimerTask {
        self.store
            .pending_timer_tasks(workflow)
            .into_iter()
            .filter(|task| task.task_type == task_type)
            .next_back()
            .unwrap_or_else(|| panic!("no {task_type} task for {workflow}"))
    }

    pub fn activity_task(&self, workflow: &WorkflowKey, timeout_type: TimeoutType) -> TimerTask {
        self.store
            .pending_timer_tasks(workflow)
            .into_iter()
            .filter(|task| {
                task.task_type == TimerTaskType::ActivityTimeout
                    && task.timeout_type == Some(timeout_type)
            })
            .next_back()
            .unwrap_or_else(|| panic!("no {timeout_type:?} activity task for {workflow}"))
    }
}

/// Schedule, start and complete the first decision at `t0`.
///
/// Returns the decision's schedule id.
pub fn complete_first_decision(state: &mut MutableState) -> timerflow::Result<i64> {
    let decision = state.add_decision_task_scheduled_event(t0(), None)?;
    state.add_decision_task_started_event(t0(), decision.schedule_id)?;
    state.add_decision_task_completed_event(t0(), decision.schedule_id)?;
    Ok(decision.schedule_id)
}

/// Event type names of an execution's committed history.
pub fn event_types(store: &MemoryStore, workflow: &WorkflowKey) -> Vec<&'static str> {
    store
        .history(workflow)
        .iter()
        .map(|event| event.attributes.event_type())
        .collect()
}
