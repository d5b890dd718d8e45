//! Workflow execution identity and lifecycle state.

use serde::{Deserialize, Serialize};

/// Identifies one run of a workflow within a domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionKey {
    /// Owning domain
    pub domain_id: String,
    /// Workflow identifier chosen by the caller
    pub workflow_id: String,
    /// Run identifier, unique per workflow start
    pub run_id: String,
}

impl ExecutionKey {
    /// Create a new execution key.
    #[must_use]
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

    /// Storage key used by record-oriented stores.
    #[must_use]
    pub fn storage_key(&self) -> String {
        format!("{}:{}:{}", self.domain_id, self.workflow_id, self.run_id)
    }
}

impl std::fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.domain_id, self.workflow_id, self.run_id)
    }
}

/// Lifecycle state of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Created but the start event has not been recorded yet.
    Created,
    /// Accepting history mutations.
    Running,
    /// Completed successfully.
    Completed,
    /// Failed.
    Failed,
    /// Terminated by an operator.
    Terminated,
    /// Cancelled on request.
    Cancelled,
    /// Exceeded its workflow timeout.
    TimedOut,
}

impl ExecutionState {
    /// Whether the execution accepts no further history mutation.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Terminated | Self::Cancelled | Self::TimedOut
        )
    }
}
