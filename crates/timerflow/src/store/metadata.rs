//! Fixed cluster topology.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::ClusterMetadata;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct DomainEntry {
    global: bool,
    active_cluster: String,
}

/// Cluster metadata served from an in-memory table.
///
/// Failover versions map to clusters by `version % failover_version_increment`,
/// which must equal the cluster's initial failover version.
///
/// # Example
///
/// ```
/// use timerflow::store::{ClusterMetadata, StaticClusterMetadata};
///
/// let metadata = StaticClusterMetadata::new("active", 10)
///     .with_cluster("active", 1)
///     .with_cluster("standby", 2);
///
/// assert_eq!(metadata.cluster_name_for_failover_version(21).unwrap(), "active");
/// assert_eq!(metadata.cluster_name_for_failover_version(32).unwrap(), "standby");
/// ```
#[derive(Debug)]
pub struct StaticClusterMetadata {
    current_cluster: String,
    failover_version_increment: i64,
    initial_versions: HashMap<i64, String>,
    domains: Mutex<HashMap<String, DomainEntry>>,
}

impl StaticClusterMetadata {
    pub fn new(current_cluster: impl Into<String>, failover_version_increment: i64) -> Self {
        Self {
            current_cluster: current_cluster.into(),
            failover_version_increment,
            initial_versions: HashMap::new(),
            domains: Mutex::new(HashMap::new()),
        }
    }

    /// Register a cluster and its initial failover version.
    pub fn with_cluster(mut self, name: impl Into<String>, initial_failover_version: i64) -> Self {
        self.initial_versions
            .insert(initial_failover_version, name.into());
        self
    }

    /// Register a domain replicated across clusters.
    pub fn with_global_domain(self, domain_id: impl Into<String>, active_cluster: impl Into<String>) -> Self {
        self.set_domain(domain_id, true, active_cluster);
        self
    }

    /// Register a domain that lives only in the current cluster.
    pub fn with_local_domain(self, domain_id: impl Into<String>) -> Self {
        let current = self.current_cluster.clone();
        self.set_domain(domain_id, false, current);
        self
    }

    /// Move a domain's active cluster, as a failover would.
    pub fn failover(&self, domain_id: &str, active_cluster: impl Into<String>) {
        if let Some(entry) = self.domains().get_mut(domain_id) {
            entry.active_cluster = active_cluster.into();
        }
    }

    fn set_domain(&self, domain_id: impl Into<String>, global: bool, active_cluster: impl Into<String>) {
        self.domains().insert(
            domain_id.into(),
            DomainEntry {
                global,
                active_cluster: active_cluster.into(),
            },
        );
    }

    fn domains(&self) -> MutexGuard<'_, HashMap<String, DomainEntry>> {
        self.domains
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn domain(&self, domain_id: &str) -> Result<DomainEntry> {
        self.domains()
            .get(domain_id)
            .cloned()
            .ok_or_else(|| Error::store(format!("domain {domain_id} not found")))
    }
}

#[async_trait]
impl ClusterMetadata for StaticClusterMetadata {
    fn current_cluster_name(&self) -> &str {
        &self.current_cluster
    }

    fn cluster_name_for_failover_version(&self, version: i64) -> Result<String> {
        if version < 0 || self.failover_version_increment <= 0 {
            return Err(Error::UnknownCluster(format!("failover version {version}")));
        }
        let initial = version % self.failover_version_increment;
        self.initial_versions
            .get(&initial)
            .cloned()
            .ok_or_else(|| Error::UnknownCluster(format!("failover version {version}")))
    }

    async fn is_global_domain(&self, domain_id: &str) -> Result<bool> {
        Ok(self.domain(domain_id)?.global)
    }

    async fn active_cluster_name(&self, domain_id: &str) -> Result<String> {
        Ok(self.domain(domain_id)?.active_cluster)
    }
}
