//! Persisted forms of mutable state: a full snapshot and an incremental mutation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::events::HistoryEvent;
use super::info::{ActivityInfo, DecisionInfo, ExecutionInfo, TimerInfo};
use super::version_history::VersionHistories;
use crate::task::{TimerTask, TransferTask};

/// Everything needed to rebuild a [`MutableState`](super::MutableState).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub execution_info: ExecutionInfo,
    pub version_histories: VersionHistories,
    pub activities: BTreeMap<i64, ActivityInfo>,
    pub timers: BTreeMap<String, TimerInfo>,
    pub decision: Option<DecisionInfo>,
    /// Failover version used for new writes.
    pub current_version: i64,
    /// Optimistic concurrency token, bumped by every persisted mutation.
    pub db_version: i64,
}

/// The delta produced by closing one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMutation {
    pub execution_info: ExecutionInfo,
    pub version_histories: VersionHistories,
    pub upsert_activities: Vec<ActivityInfo>,
    pub delete_activities: Vec<i64>,
    pub upsert_timers: Vec<TimerInfo>,
    pub delete_timers: Vec<String>,
    /// The pending decision after the transaction, replacing the stored one.
    pub decision: Option<DecisionInfo>,
    pub current_version: i64,
    pub new_events: Vec<HistoryEvent>,
    pub timer_tasks: Vec<TimerTask>,
    pub transfer_tasks: Vec<TransferTask>,
    /// Db version after this mutation is applied.
    pub db_version: i64,
}

impl WorkflowMutation {
    /// Whether the mutation changes only the db version.
    pub fn is_empty(&self) -> bool {
        self.upsert_activities.is_empty()
            && self.delete_activities.is_empty()
            && self.upsert_timers.is_empty()
            && self.delete_timers.is_empty()
            && self.new_events.is_empty()
            && self.timer_tasks.is_empty()
            && self.transfer_tasks.is_empty()
    }
}

impl WorkflowSnapshot {
    /// Build the initial snapshot of a new execution from its first mutation.
    pub fn from_mutation(mutation: &WorkflowMutation) -> Self {
        let mut snapshot = Self {
            execution_info: mutation.execution_info.clone(),
            version_histories: mutation.version_histories.clone(),
            activities: BTreeMap::new(),
            timers: BTreeMap::new(),
            decision: None,
            current_version: mutation.current_version,
            db_version: 0,
        };
        snapshot.apply(mutation);
        snapshot
    }

    /// Apply a mutation in place.
    pub fn apply(&mut self, mutation: &WorkflowMutation) {
        self.execution_info = mutation.execution_info.clone();
        self.version_histories = mutation.version_histories.clone();
        // Deletes first: a timer id can be retired and restarted in one mutation.
        for schedule_id in &mutation.delete_activities {
            self.activities.remove(schedule_id);
        }
        for timer_id in &mutation.delete_timers {
            self.timers.remove(timer_id);
        }
        for activity in &mutation.upsert_activities {
            self.activities.insert(activity.schedule_id, activity.clone());
        }
        for timer in &mutation.upsert_timers {
            self.timers.insert(timer.timer_id.clone(), timer.clone());
        }
        self.decision = mutation.decision.clone();
        self.current_version = mutation.current_version;
        self.db_version = mutation.db_version;
    }
}
