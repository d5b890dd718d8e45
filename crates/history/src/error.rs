//! Error taxonomy for the timer subsystem.
//!
//! Processor-level errors are handled locally (retry, defer, or discard);
//! none of them escape the scheduling loop.

use thiserror::Error;

use crate::persistence::PersistenceError;

/// Errors raised by the history service's timer subsystem.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// A storage call failed; retried with backoff when the cause is transient.
    #[error("storage error: {0}")]
    TransientStorage(#[source] PersistenceError),

    /// The execution moved on since it was loaded.
    #[error("conditional update conflict: expected next event id {expected}, found {actual}")]
    ConditionalUpdateConflict { expected: i64, actual: i64 },

    /// The referenced timer, activity, or decision is already resolved.
    #[error("stale timer task {task_id}: {reason}")]
    StaleTimerTask { task_id: i64, reason: String },

    /// The target execution does not exist.
    #[error("workflow execution not found: {execution}")]
    WorkflowNotFound { execution: String },

    /// The target execution is closed and accepts no further mutation.
    #[error("workflow execution already closed: {execution}")]
    WorkflowTerminal { execution: String },

    /// A timeout attribute is missing or non-positive.
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    /// A mutation referenced state that does not exist.
    #[error("invalid mutation: {reason}")]
    InvalidMutation { reason: String },

    /// Core error (configuration loading, records).
    #[error(transparent)]
    Core(#[from] hourglass_core::Error),
}

impl HistoryError {
    /// Create a configuration error.
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Create an invalid mutation error.
    pub fn invalid_mutation(reason: impl Into<String>) -> Self {
        Self::InvalidMutation {
            reason: reason.into(),
        }
    }

    pub fn stale(task_id: i64, reason: impl Into<String>) -> Self {
        Self::StaleTimerTask {
            task_id,
            reason: reason.into(),
        }
    }

    /// Create a workflow not found error.
    pub fn workflow_not_found(execution: impl std::fmt::Display) -> Self {
        Self::WorkflowNotFound {
            execution: execution.to_string(),
        }
    }

    /// Create a workflow terminal error.
    pub fn workflow_terminal(execution: impl std::fmt::Display) -> Self {
        Self::WorkflowTerminal {
            execution: execution.to_string(),
        }
    }

    /// Check if the operation should be retried with backoff.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::TransientStorage(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Check if the error is an optimistic-concurrency conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::ConditionalUpdateConflict { .. })
    }

    /// Check if the task that raised this error can be deleted without mutation.
    #[must_use]
    pub const fn is_benign(&self) -> bool {
        matches!(
            self,
            Self::StaleTimerTask { .. } | Self::WorkflowNotFound { .. } | Self::WorkflowTerminal { .. }
        )
    }
}

impl From<PersistenceError> for HistoryError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::ConditionFailed { expected, actual } => {
                Self::ConditionalUpdateConflict { expected, actual }
            }
            PersistenceError::NotFound { entity_type, id } if entity_type == EXECUTION_ENTITY => {
                Self::WorkflowNotFound { execution: id }
            }
            other => Self::TransientStorage(other),
        }
    }
}

/// Entity name used for workflow execution records.
pub const EXECUTION_ENTITY: &str = "workflow_execution";

/// Result type for timer subsystem operations.
pub type HistoryResult<T> = Result<T, HistoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_failed_maps_to_conflict() {
        let err = HistoryError::from(PersistenceError::condition_failed(3, 4));
        assert!(err.is_conflict());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_missing_execution_maps_to_not_found() {
        let err = HistoryError::from(PersistenceError::not_found(EXECUTION_ENTITY, "d/wf/run"));
        assert!(matches!(err, HistoryError::WorkflowNotFound { .. }));
        assert!(err.is_benign());
        assert!(HistoryError::stale(9, "decision already completed").is_benign());
    }

    #[test]
    fn test_transient_storage_is_retryable() {
        let err = HistoryError::from(PersistenceError::timed_out(100));
        assert!(err.is_retryable());
        assert!(!err.is_benign());

        let err = HistoryError::from(PersistenceError::codec("bad json"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_configuration_error_is_final() {
        let err = HistoryError::configuration("timeout must be positive");
        assert!(!err.is_retryable());
        assert!(!err.is_benign());
        assert_eq!(err.to_string(), "configuration error: timeout must be positive");
    }
}
