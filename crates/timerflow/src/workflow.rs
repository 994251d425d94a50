//! Workflow execution identity.

use serde::{Deserialize, Serialize};

/// Identifies one workflow execution (a single run).
///
/// Every timer task, mutable state snapshot and execution lease is keyed by
/// the `(domain_id, workflow_id, run_id)` triple.
///
/// # Example
///
/// ```
/// use timerflow::WorkflowKey;
///
/// let key = WorkflowKey::new("payments", "order-123", "0f8e");
/// assert_eq!(key.workflow_id(), "order-123");
/// assert_eq!(format!("{}", key), "payments/order-123/0f8e");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowKey {
    domain_id: String,
    workflow_id: String,
    run_id: String,
}

impl WorkflowKey {
    /// Create a new execution key.
    pub fn new(
        domain_id: impl Into<String>,
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            domain_id: domain_id.into(),
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
        }
    }

    /// The domain (namespace) the execution belongs to.
    pub fn domain_id(&self) -> &str {
        &self.domain_id
    }

    /// The business workflow identifier.
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// The run identifier of this execution.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

impl std::fmt::Display for WorkflowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.domain_id, self.workflow_id, self.run_id)
    }
}
