//! History events appended by mutable-state operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::timeout::TimeoutType;

/// Event ID used when an event reference is absent.
pub const EMPTY_EVENT_ID: i64 = -23;

/// ID of the first event in every history.
pub const FIRST_EVENT_ID: i64 = 1;

/// One entry in a workflow's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// Position in the history, starting at [`FIRST_EVENT_ID`]
    pub event_id: i64,
    /// When the event was recorded
    pub timestamp: DateTime<Utc>,
    /// What happened
    pub attributes: EventAttributes,
}

/// Event-specific payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventAttributes {
    WorkflowExecutionStarted {
        workflow_type: String,
        task_list: String,
        execution_timeout_secs: i32,
        decision_timeout_secs: i32,
    },
    WorkflowExecutionCompleted {
        decision_completed_id: i64,
    },
    DecisionTaskScheduled {
        task_list: String,
        timeout_secs: i32,
        attempt: i64,
    },
    DecisionTaskStarted {
        scheduled_id: i64,
        identity: String,
    },
    DecisionTaskCompleted {
        scheduled_id: i64,
        started_id: i64,
        identity: String,
    },
    DecisionTaskTimedOut {
        scheduled_id: i64,
        started_id: i64,
        timeout_type: TimeoutType,
    },
    TimerStarted {
        timer_id: String,
        start_to_fire_timeout_secs: i64,
        decision_completed_id: i64,
    },
    TimerFired {
        timer_id: String,
        started_id: i64,
    },
    TimerCanceled {
        timer_id: String,
        started_id: i64,
    },
    ActivityTaskScheduled {
        activity_id: String,
        schedule_to_start_timeout_secs: i32,
        schedule_to_close_timeout_secs: i32,
        start_to_close_timeout_secs: i32,
        heartbeat_timeout_secs: i32,
        decision_completed_id: i64,
    },
    ActivityTaskStarted {
        scheduled_id: i64,
        request_id: String,
    },
    ActivityTaskCompleted {
        scheduled_id: i64,
        started_id: i64,
        identity: String,
    },
    ActivityTaskTimedOut {
        scheduled_id: i64,
        started_id: i64,
        timeout_type: TimeoutType,
    },
}

impl EventAttributes {
    /// Short name of the event kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::WorkflowExecutionStarted { .. } => "WorkflowExecutionStarted",
            Self::WorkflowExecutionCompleted { .. } => "WorkflowExecutionCompleted",
            Self::DecisionTaskScheduled { .. } => "DecisionTaskScheduled",
            Self::DecisionTaskStarted { .. } => "DecisionTaskStarted",
            Self::DecisionTaskCompleted { .. } => "DecisionTaskCompleted",
            Self::DecisionTaskTimedOut { .. } => "DecisionTaskTimedOut",
            Self::TimerStarted { .. } => "TimerStarted",
            Self::TimerFired { .. } => "TimerFired",
            Self::TimerCanceled { .. } => "TimerCanceled",
            Self::ActivityTaskScheduled { .. } => "ActivityTaskScheduled",
            Self::ActivityTaskStarted { .. } => "ActivityTaskStarted",
            Self::ActivityTaskCompleted { .. } => "ActivityTaskCompleted",
            Self::ActivityTaskTimedOut { .. } => "ActivityTaskTimedOut",
        }
    }
}
