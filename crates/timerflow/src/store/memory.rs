//! In-process execution store and timer task queue.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::debug;

use super::queue::{ClaimedTimerTask, TimerTaskQueue};
use super::ExecutionStore;
use crate::clock::{SystemTimeSource, TimeSource};
use crate::error::{Error, Result};
use crate::mutable_state::{HistoryEvent, WorkflowMutation, WorkflowSnapshot};
use crate::task::{TimerTask, TransferTask};
use crate::workflow::WorkflowKey;

/// Execution store and timer queue held in memory.
///
/// Snapshots are kept JSON-encoded so every load returns an independent copy.
/// Timer tasks from applied mutations are assigned increasing task ids and
/// become claimable at their visibility timestamp, measured with the store's
/// [`TimeSource`].
///
/// # Example
///
/// ```
/// use time::{Duration, OffsetDateTime};
/// use timerflow::mutable_state::{MutableState, TransactionPolicy, WorkflowStartOptions};
/// use timerflow::store::{ExecutionStore, MemoryStore};
/// use timerflow::WorkflowKey;
///
/// # #[tokio::main]
/// # async fn main() -> timerflow::Result<()> {
/// let store = MemoryStore::new();
/// let key = WorkflowKey::new("d", "w", "r");
/// let now = OffsetDateTime::now_utc();
///
/// let mut state = MutableState::new(key.clone(), 1, now);
/// state.add_workflow_execution_started_event(now, WorkflowStartOptions {
///     execution_timeout: Duration::hours(1),
///     decision_start_to_close_timeout: Duration::seconds(10),
///     first_decision_backoff: Duration::ZERO,
/// })?;
/// store.update_mutable_state(state.close_transaction(TransactionPolicy::Active)?, 0).await?;
///
/// let loaded = store.load_mutable_state(&key).await?;
/// assert_eq!(loaded.map(|snapshot| snapshot.db_version), Some(1));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    time_source: Arc<dyn TimeSource>,
}

#[derive(Default)]
struct Inner {
    executions: HashMap<WorkflowKey, StoredExecution>,
    timer_queue: BTreeMap<i64, QueueEntry>,
    transfer_tasks: Vec<TransferTask>,
    next_task_id: i64,
    injected_conflicts: usize,
}

struct StoredExecution {
    snapshot: String,
    db_version: i64,
    history: Vec<HistoryEvent>,
    mutations: Vec<WorkflowMutation>,
}

struct QueueEntry {
    task: TimerTask,
    available_at: OffsetDateTime,
    locked_by: Option<String>,
    locked_until: Option<OffsetDateTime>,
    attempts: u32,
    last_error: Option<String>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Store whose queue uses the system clock.
    pub fn new() -> Self {
        Self::with_time_source(Arc::new(SystemTimeSource))
    }

    /// Store whose queue measures due-ness with `time_source`.
    pub fn with_time_source(time_source: Arc<dyn TimeSource>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_task_id: 1,
                ..Inner::default()
            })),
            time_source,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the next `count` updates with `ConditionFailed`, as if a
    /// concurrent writer won the race.
    pub fn inject_condition_failures(&self, count: usize) {
        self.lock().injected_conflicts = count;
    }

    /// All history events committed for an execution.
    pub fn history(&self, workflow: &WorkflowKey) -> Vec<HistoryEvent> {
        self.lock()
            .executions
            .get(workflow)
            .map(|stored| stored.history.clone())
            .unwrap_or_default()
    }

    /// Mutations applied to an execution, oldest first.
    pub fn mutations(&self, workflow: &WorkflowKey) -> Vec<WorkflowMutation> {
        self.lock()
            .executions
            .get(workflow)
            .map(|stored| stored.mutations.clone())
            .unwrap_or_default()
    }

    /// Timer tasks still in the queue for an execution, by task id.
    pub fn pending_timer_tasks(&self, workflow: &WorkflowKey) -> Vec<TimerTask> {
        self.lock()
            .timer_queue
            .values()
            .filter(|entry| &entry.task.workflow == workflow)
            .map(|entry| entry.task.clone())
            .collect()
    }

    /// Last failure recorded for a queued task.
    pub fn last_error(&self, task_id: i64) -> Option<String> {
        self.lock()
            .timer_queue
            .get(&task_id)
            .and_then(|entry| entry.last_error.clone())
    }

    /// Transfer tasks emitted by all applied mutations.
    pub fn transfer_tasks(&self) -> Vec<TransferTask> {
        self.lock().transfer_tasks.clone()
    }
}

impl Inner {
    fn allocate_task_id(&mut self) -> i64 {
        let id = self.next_task_id;
        self.next_task_id += 1;
        id
    }

    fn entry_mut(&mut self, task_id: i64) -> Result<&mut QueueEntry> {
        self.timer_queue
            .get_mut(&task_id)
            .ok_or_else(|| Error::store(format!("timer task {task_id} not found")))
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn load_mutable_state(&self, workflow: &WorkflowKey) -> Result<Option<WorkflowSnapshot>> {
        let inner = self.lock();
        let Some(stored) = inner.executions.get(workflow) else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&stored.snapshot)?))
    }

    async fn update_mutable_state(
        &self,
        mutation: WorkflowMutation,
        expected_db_version: i64,
    ) -> Result<()> {
        let workflow = mutation.execution_info.workflow.clone();
        let mut inner = self.lock();
        let stored_version = match inner.executions.get(&workflow) {
            Some(stored) => stored.db_version,
            None if expected_db_version == 0 => 0,
            None => return Err(Error::EntityNotExists(workflow)),
        };

        if inner.injected_conflicts > 0 {
            inner.injected_conflicts -= 1;
            return Err(Error::ConditionFailed {
                workflow,
                expected: expected_db_version,
                actual: stored_version + 1,
            });
        }
        if stored_version != expected_db_version {
            return Err(Error::ConditionFailed {
                workflow,
                expected: expected_db_version,
                actual: stored_version,
            });
        }

        let snapshot = match inner.executions.get(&workflow) {
            Some(stored) => {
                let mut snapshot: WorkflowSnapshot = serde_json::from_str(&stored.snapshot)?;
                snapshot.apply(&mutation);
                snapshot
            }
            None => WorkflowSnapshot::from_mutation(&mutation),
        };
        let encoded = serde_json::to_string(&snapshot)?;

        for task in &mutation.timer_tasks {
            let task_id = inner.allocate_task_id();
            let task = task.clone().with_task_id(task_id);
            inner.timer_queue.insert(
                task_id,
                QueueEntry {
                    available_at: task.visibility_timestamp,
                    task,
                    locked_by: None,
                    locked_until: None,
                    attempts: 0,
                    last_error: None,
                },
            );
        }
        for task in &mutation.transfer_tasks {
            let mut task = task.clone();
            task.task_id = inner.allocate_task_id();
            inner.transfer_tasks.push(task);
        }

        debug!(
            workflow = %workflow,
            db_version = mutation.db_version,
            events = mutation.new_events.len(),
            timer_tasks = mutation.timer_tasks.len(),
            "Applied workflow mutation"
        );
        let stored = inner
            .executions
            .entry(workflow)
            .or_insert_with(|| StoredExecution {
                snapshot: String::new(),
                db_version: 0,
                history: Vec::new(),
                mutations: Vec::new(),
            });
        stored.snapshot = encoded;
        stored.db_version = snapshot.db_version;
        stored.history.extend(mutation.new_events.iter().cloned());
        stored.mutations.push(mutation);
        Ok(())
    }
}

#[async_trait]
impl TimerTaskQueue for MemoryStore {
    async fn claim_due_task(
        &self,
        worker_id: &str,
        lock_duration: Duration,
    ) -> Result<Option<ClaimedTimerTask>> {
        let now = self.time_source.now();
        let mut inner = self.lock();
        let due = inner
            .timer_queue
            .values_mut()
            .filter(|entry| entry.available_at <= now)
            .filter(|entry| entry.locked_until.is_none_or(|until| until <= now))
            .min_by_key(|entry| (entry.available_at, entry.task.task_id));

        let Some(entry) = due else {
            return Ok(None);
        };
        entry.locked_by = Some(worker_id.to_string());
        entry.locked_until = Some(now + lock_duration);
        Ok(Some(ClaimedTimerTask {
            task: entry.task.clone(),
            attempts: entry.attempts,
        }))
    }

    async fn complete(&self, task_id: i64) -> Result<()> {
        self.lock()
            .timer_queue
            .remove(&task_id)
            .map(|_| ())
            .ok_or_else(|| Error::store(format!("timer task {task_id} not found")))
    }

    async fn redispatch(&self, task_id: i64, delay: Duration) -> Result<()> {
        let now = self.time_source.now();
        let mut inner = self.lock();
        let entry = inner.entry_mut(task_id)?;
        entry.locked_by = None;
        entry.locked_until = None;
        entry.available_at = now + delay;
        Ok(())
    }

    async fn record_failure(&self, task_id: i64, error: &str, backoff: Duration) -> Result<()> {
        let now = self.time_source.now();
        let mut inner = self.lock();
        let entry = inner.entry_mut(task_id)?;
        entry.attempts += 1;
        entry.last_error = Some(error.to_string());
        entry.locked_by = None;
        entry.locked_until = None;
        entry.available_at = now + backoff;
        Ok(())
    }
}
