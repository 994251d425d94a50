//! Per-execution lease and cached mutable state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{Error, Result};
use crate::mutable_state::{MutableState, TransactionPolicy};
use crate::store::ExecutionStore;
use crate::workflow::WorkflowKey;

type Slot = Arc<AsyncMutex<Option<MutableState>>>;
type Slots = Arc<Mutex<HashMap<WorkflowKey, Slot>>>;

const DEFAULT_CAPACITY: usize = 1024;

/// Exclusive leases over executions, each caching its loaded mutable state.
///
/// Two deliveries for the same execution serialize on the lease; different
/// executions proceed in parallel.
///
/// A released lease keeps its state cached only while the execution is
/// running and the cache holds at most `capacity` entries. Idle entries are
/// evicted to make room for new executions.
#[derive(Debug)]
pub struct ExecutionCache {
    slots: Slots,
    capacity: usize,
}

impl Default for ExecutionCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl ExecutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            capacity,
        }
    }

    /// Number of executions with a lease held, awaited or cached.
    pub fn len(&self) -> usize {
        lock_slots(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Acquire the lease for `workflow`, waiting at most `timeout`.
    ///
    /// The lease is released when the returned context is dropped.
    pub async fn acquire(&self, workflow: &WorkflowKey, timeout: Duration) -> Result<WorkflowContext> {
        let slot = {
            let mut slots = lock_slots(&self.slots);
            if !slots.contains_key(workflow) {
                let excess = (slots.len() + 1).saturating_sub(self.capacity);
                evict_idle(&mut slots, excess);
            }
            Arc::clone(slots.entry(workflow.clone()).or_default())
        };
        let guard = tokio::time::timeout(timeout, slot.lock_owned())
            .await
            .map_err(|_| Error::LeaseTimeout(workflow.clone()))?;
        Ok(WorkflowContext {
            workflow: workflow.clone(),
            state: guard,
            slots: Arc::clone(&self.slots),
            capacity: self.capacity,
        })
    }
}

fn lock_slots(slots: &Mutex<HashMap<WorkflowKey, Slot>>) -> MutexGuard<'_, HashMap<WorkflowKey, Slot>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Remove up to `count` slots that nobody holds or awaits.
fn evict_idle(slots: &mut HashMap<WorkflowKey, Slot>, count: usize) {
    if count == 0 {
        return;
    }
    let idle: Vec<WorkflowKey> = slots
        .iter()
        .filter(|(_, slot)| Arc::strong_count(slot) == 1)
        .map(|(key, _)| key.clone())
        .take(count)
        .collect();
    for key in idle {
        debug!(workflow = %key, "Evicted cached mutable state");
        slots.remove(&key);
    }
}

/// A held execution lease.
pub struct WorkflowContext {
    workflow: WorkflowKey,
    state: OwnedMutexGuard<Option<MutableState>>,
    slots: Slots,
    capacity: usize,
}

impl WorkflowContext {
    pub fn workflow(&self) -> &WorkflowKey {
        &self.workflow
    }

    /// The cached state, loading it from `store` on a miss.
    ///
    /// Returns `None` when the execution does not exist.
    pub async fn load<S: ExecutionStore>(&mut self, store: &S) -> Result<Option<&mut MutableState>> {
        if self.state.is_none() {
            let Some(snapshot) = store.load_mutable_state(&self.workflow).await? else {
                return Ok(None);
            };
            debug!(workflow = %self.workflow, db_version = snapshot.db_version, "Loaded mutable state");
            *self.state = Some(MutableState::from_snapshot(snapshot));
        }
        Ok(self.state.as_mut())
    }

    /// Drop the cached state so the next load reads the store.
    pub fn clear(&mut self) {
        *self.state = None;
    }

    /// Close the transaction and write it conditioned on the loaded db version.
    ///
    /// On any failure the cached state is cleared, since it no longer matches
    /// what is stored.
    pub async fn persist<S: ExecutionStore>(&mut self, store: &S, policy: TransactionPolicy) -> Result<()> {
        let Some(state) = self.state.as_mut() else {
            return Err(Error::internal(format!(
                "lease held on {} without mutable state",
                self.workflow
            )));
        };
        let expected = state.db_version();
        let result = match state.close_transaction(policy) {
            Ok(mutation) => store.update_mutable_state(mutation, expected).await,
            Err(err) => Err(err),
        };
        if result.is_err() {
            self.clear();
        }
        result
    }
}

impl Drop for WorkflowContext {
    fn drop(&mut self) {
        let keep = self.state.as_ref().is_some_and(MutableState::is_running);
        let mut slots = lock_slots(&self.slots);
        if keep && slots.len() <= self.capacity {
            return;
        }
        // The map and this lease are the only holders; nobody is waiting.
        let idle = slots
            .get(&self.workflow)
            .is_some_and(|slot| Arc::ptr_eq(slot, OwnedMutexGuard::mutex(&self.state)))
            && Arc::strong_count(OwnedMutexGuard::mutex(&self.state)) == 2;
        if idle {
            slots.remove(&self.workflow);
        }
    }
}
