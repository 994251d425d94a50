//! Collaborator interfaces used by the executor.
//!
//! - [`ExecutionStore`]: load and conditionally update mutable state
//! - [`HistoryResender`]: pull missing replicated history from the active cluster
//! - [`ClusterMetadata`]: domain → active cluster and failover version → cluster
//! - [`TimerTaskQueue`]: claim and settle due timer tasks
//!
//! [`MemoryStore`] implements the store and the queue in process, and
//! [`StaticClusterMetadata`] serves metadata from a fixed table.

mod memory;
mod metadata;
mod queue;

use async_trait::async_trait;

pub use memory::MemoryStore;
pub use metadata::StaticClusterMetadata;
pub use queue::{ClaimedTimerTask, TimerTaskQueue};

use crate::error::Result;
use crate::mutable_state::{WorkflowMutation, WorkflowSnapshot};
use crate::workflow::WorkflowKey;

/// Persistence for mutable state.
///
/// Implementations must apply a mutation atomically together with its timer
/// and transfer tasks, and reject it with
/// [`Error::ConditionFailed`](crate::Error::ConditionFailed) when the stored db
/// version differs from `expected_db_version`. An expected version of `0`
/// creates the execution.
#[async_trait]
pub trait ExecutionStore: Send + Sync + Clone + 'static {
    /// Load the latest snapshot, or `None` if the execution does not exist.
    async fn load_mutable_state(&self, workflow: &WorkflowKey) -> Result<Option<WorkflowSnapshot>>;

    /// Conditionally apply a mutation.
    async fn update_mutable_state(
        &self,
        mutation: WorkflowMutation,
        expected_db_version: i64,
    ) -> Result<()>;
}

/// Requests catch-up replication of one execution's history.
///
/// Calls are at-least-once and may be repeated for the same range.
#[async_trait]
pub trait HistoryResender: Send + Sync + 'static {
    /// Pull events after `(from_event_id, from_version)` from the active cluster.
    async fn send_single_workflow_history(
        &self,
        workflow: &WorkflowKey,
        from_event_id: i64,
        from_version: i64,
    ) -> Result<()>;
}

/// Cluster and domain topology.
#[async_trait]
pub trait ClusterMetadata: Send + Sync + 'static {
    /// Name of the cluster this process runs in.
    fn current_cluster_name(&self) -> &str;

    /// Cluster that owns a failover version.
    fn cluster_name_for_failover_version(&self, version: i64) -> Result<String>;

    /// Whether the domain replicates across clusters.
    async fn is_global_domain(&self, domain_id: &str) -> Result<bool>;

    /// Cluster currently active for the domain.
    async fn active_cluster_name(&self, domain_id: &str) -> Result<String>;
}
