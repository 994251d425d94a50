//! Active vs standby executor selection.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::config::ExecutorConfig;
use super::guard::{ActiveGuard, StandbyGuard};
use super::{TaskOutcome, TimerTaskExecutor};
use crate::cache::ExecutionCache;
use crate::clock::ShardClock;
use crate::error::{Error, Result};
use crate::store::{ClusterMetadata, ExecutionStore, HistoryResender};
use crate::task::TimerTask;

/// Routes each task to the active executor or to the standby executor of the
/// cluster it was replicated from.
///
/// All executors share one [`ExecutionCache`], so an execution's lease is
/// exclusive across modes.
pub struct TimerTaskRouter<S> {
    metadata: Arc<dyn ClusterMetadata>,
    active: TimerTaskExecutor<S, ActiveGuard>,
    standby: HashMap<String, TimerTaskExecutor<S, StandbyGuard>>,
}

impl<S: ExecutionStore> TimerTaskRouter<S> {
    /// Build executors for the current cluster and each of `remote_clusters`.
    pub fn new<I>(
        store: S,
        clock: Arc<ShardClock>,
        metadata: Arc<dyn ClusterMetadata>,
        resender: Arc<dyn HistoryResender>,
        config: ExecutorConfig,
        remote_clusters: I,
    ) -> Result<Self>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let cache = Arc::new(ExecutionCache::with_capacity(config.cache_capacity));
        let current = metadata.current_cluster_name().to_string();
        let active = TimerTaskExecutor::new(
            store.clone(),
            cache.clone(),
            clock.clone(),
            metadata.clone(),
            ActiveGuard::new(current.clone()),
            config.clone(),
        )?;

        let mut standby = HashMap::new();
        for cluster in remote_clusters {
            let cluster = cluster.into();
            if cluster == current {
                continue;
            }
            let guard = StandbyGuard::new(cluster.clone(), resender.clone(), &config);
            let executor = TimerTaskExecutor::new(
                store.clone(),
                cache.clone(),
                clock.clone(),
                metadata.clone(),
                guard,
                config.clone(),
            )?;
            standby.insert(cluster, executor);
        }

        Ok(Self {
            metadata,
            active,
            standby,
        })
    }

    pub fn active(&self) -> &TimerTaskExecutor<S, ActiveGuard> {
        &self.active
    }

    pub fn standby(&self, cluster: &str) -> Option<&TimerTaskExecutor<S, StandbyGuard>> {
        self.standby.get(cluster)
    }

    /// Execute `task` in the mode its domain currently calls for.
    pub async fn execute(&self, task: &TimerTask) -> Result<TaskOutcome> {
        let domain_id = task.workflow.domain_id();
        let current = self.metadata.current_cluster_name();
        if !self.metadata.is_global_domain(domain_id).await? {
            return self.active.execute(task).await;
        }
        let active_cluster = self.metadata.active_cluster_name(domain_id).await?;
        if active_cluster == current {
            return self.active.execute(task).await;
        }

        // Tasks written here before a failover are checked against the new
        // active cluster.
        let mut owner = self.metadata.cluster_name_for_failover_version(task.version)?;
        if owner == current {
            owner = active_cluster;
        }
        debug!(task_id = task.task_id, workflow = %task.workflow, cluster = %owner, "Routing task to standby");
        let executor = self
            .standby
            .get(&owner)
            .ok_or_else(|| Error::UnknownCluster(owner.clone()))?;
        executor.execute(task).await
    }
}
