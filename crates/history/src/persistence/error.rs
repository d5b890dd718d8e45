//! Errors raised at the shard store boundary.
//!
//! Callers decide whether to retry through [`PersistenceError::is_retryable`];
//! a failed condition is never retried here since the caller must reload state first.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PersistenceError {
    /// The store could not be reached
    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("store query failed: {reason}")]
    Query { reason: String },

    #[error("{entity_type} '{id}' does not exist")]
    NotFound { entity_type: String, id: String },

    #[error("{entity_type} '{id}' already exists")]
    Duplicate { entity_type: String, id: String },

    /// Conditional update rejected: another writer advanced the execution
    #[error("condition failed: expected next event id {expected}, found {actual}")]
    ConditionFailed { expected: i64, actual: i64 },

    /// A stored row could not be encoded or decoded
    #[error("codec error: {reason}")]
    Codec { reason: String },

    #[error("store call timed out after {after_ms}ms")]
    TimedOut { after_ms: u64 },

    #[error("schema definition rejected: {reason}")]
    Schema { reason: String },
}

impl PersistenceError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn query(reason: impl Into<String>) -> Self {
        Self::Query {
            reason: reason.into(),
        }
    }

    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn duplicate(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::Duplicate {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub const fn condition_failed(expected: i64, actual: i64) -> Self {
        Self::ConditionFailed { expected, actual }
    }

    pub fn codec(reason: impl Into<String>) -> Self {
        Self::Codec {
            reason: reason.into(),
        }
    }

    pub const fn timed_out(after_ms: u64) -> Self {
        Self::TimedOut { after_ms }
    }

    pub fn schema(reason: impl Into<String>) -> Self {
        Self::Schema {
            reason: reason.into(),
        }
    }

    /// Transient failures: the same call may succeed if repeated unchanged.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::TimedOut { .. } | Self::Query { .. }
        )
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        Self::codec(err.to_string())
    }
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Thrown by the conditional-update transaction, followed by `:{expected}:{actual}`.
pub(crate) const CONDITION_FAILED_MARKER: &str = "hourglass:condition_failed";

/// Map a SurrealDB error onto the store taxonomy by inspecting its message.
pub fn from_surrealdb_error(err: impl fmt::Display) -> PersistenceError {
    let msg = err.to_string();
    let lower = msg.to_ascii_lowercase();

    if let Some(idx) = msg.find(CONDITION_FAILED_MARKER) {
        let rest = msg
            .get(idx.saturating_add(CONDITION_FAILED_MARKER.len())..)
            .unwrap_or_default();
        let (expected, actual) = parse_condition_versions(rest);
        PersistenceError::condition_failed(expected, actual)
    } else if lower.contains("timeout") || lower.contains("timed out") {
        PersistenceError::timed_out(0)
    } else if lower.contains("connect") {
        PersistenceError::unavailable(msg)
    } else if lower.contains("already exists") || lower.contains("duplicate") {
        PersistenceError::duplicate("record", msg)
    } else {
        PersistenceError::query(msg)
    }
}

/// Unparseable versions become -1.
fn parse_condition_versions(rest: &str) -> (i64, i64) {
    let mut versions = rest.trim_start_matches(':').split(':').map(|part| {
        part.chars()
            .take_while(|c| c.is_ascii_digit() || *c == '-')
            .collect::<String>()
            .parse::<i64>()
            .unwrap_or(-1)
    });
    (
        versions.next().unwrap_or(-1),
        versions.next().unwrap_or(-1),
    )
}
