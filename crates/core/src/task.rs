//! Persisted timer tasks and their scan order.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::execution::ExecutionKey;
use crate::timeout::TimeoutType;

/// Task ID value before the shard assigns one at persist time.
pub const UNASSIGNED_TASK_ID: i64 = 0;

/// Position of a timer task in the shard's queue.
///
/// Tasks are totally ordered by visibility timestamp, then task ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimerSequenceId {
    /// When the task becomes due
    pub visibility_timestamp: DateTime<Utc>,
    /// Shard-scoped task identifier
    pub task_id: i64,
}

impl TimerSequenceId {
    /// Create a sequence ID.
    #[must_use]
    pub const fn new(visibility_timestamp: DateTime<Utc>, task_id: i64) -> Self {
        Self {
            visibility_timestamp,
            task_id,
        }
    }
}

impl PartialOrd for TimerSequenceId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerSequenceId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.visibility_timestamp
            .cmp(&other.visibility_timestamp)
            .then(self.task_id.cmp(&other.task_id))
    }
}

impl std::fmt::Display for TimerSequenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({}, {})",
            self.visibility_timestamp.to_rfc3339(),
            self.task_id
        )
    }
}

/// A persisted timeout. Immutable once written; deleted after processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerTask {
    /// Shard-scoped identifier assigned at persist time
    pub task_id: i64,
    /// When the timeout becomes due
    pub visibility_timestamp: DateTime<Utc>,
    /// Timeout class
    pub timeout_type: TimeoutType,
    /// Target execution
    pub execution: ExecutionKey,
    /// Originating event: decision or activity schedule ID, or timer started ID
    pub event_id: i64,
    /// Activity identifier for activity timeouts
    pub activity_id: Option<String>,
    /// Timer identifier for user timers
    pub timer_id: Option<String>,
    /// Retry attempt of the decision or activity
    pub attempt: i64,
}

impl TimerTask {
    /// Create a task with no task ID assigned yet.
    #[must_use]
    pub fn new(
        execution: ExecutionKey,
        timeout_type: TimeoutType,
        visibility_timestamp: DateTime<Utc>,
        event_id: i64,
    ) -> Self {
        Self {
            task_id: UNASSIGNED_TASK_ID,
            visibility_timestamp,
            timeout_type,
            execution,
            event_id,
            activity_id: None,
            timer_id: None,
            attempt: 0,
        }
    }

    /// Set the activity ID.
    #[must_use]
    pub fn with_activity(mut self, activity_id: impl Into<String>) -> Self {
        self.activity_id = Some(activity_id.into());
        self
    }

    /// Set the timer ID.
    #[must_use]
    pub fn with_timer(mut self, timer_id: impl Into<String>) -> Self {
        self.timer_id = Some(timer_id.into());
        self
    }

    /// Set the attempt.
    #[must_use]
    pub const fn with_attempt(mut self, attempt: i64) -> Self {
        self.attempt = attempt;
        self
    }

    /// The task's position in the queue.
    #[must_use]
    pub const fn sequence_id(&self) -> TimerSequenceId {
        TimerSequenceId::new(self.visibility_timestamp, self.task_id)
    }

    /// Check if the task is due at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.visibility_timestamp <= now
    }
}

/// Earliest visibility timestamp among `tasks`.
#[must_use]
pub fn earliest_visibility<'a>(
    tasks: impl IntoIterator<Item = &'a TimerTask>,
) -> Option<DateTime<Utc>> {
    tasks.into_iter().map(|t| t.visibility_timestamp).min()
}
