//! Timeout classes carried by timer tasks.

use serde::{Deserialize, Serialize};

/// The class of deadline a timer task enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutType {
    /// A started decision task was not completed in time.
    DecisionTimeout,
    /// A scheduled activity was not picked up by a worker in time.
    ActivityScheduleToStart,
    /// A scheduled activity did not complete in time, measured from scheduling.
    ActivityScheduleToClose,
    /// A started activity did not complete in time, measured from its start.
    ActivityStartToClose,
    /// A started activity stopped heartbeating.
    ActivityHeartbeat,
    /// A user-defined timer reached its fire time.
    UserTimer,
}

/// Activity timeout classes from highest to lowest priority.
///
/// When two activity deadlines coincide exactly, the class that appears
/// first here owns the single timer task created for the activity.
pub const ACTIVITY_TIMEOUT_PRIORITY: [TimeoutType; 4] = [
    TimeoutType::ActivityScheduleToClose,
    TimeoutType::ActivityStartToClose,
    TimeoutType::ActivityScheduleToStart,
    TimeoutType::ActivityHeartbeat,
];

impl TimeoutType {
    /// All timeout classes.
    pub const ALL: [Self; 6] = [
        Self::DecisionTimeout,
        Self::ActivityScheduleToStart,
        Self::ActivityScheduleToClose,
        Self::ActivityStartToClose,
        Self::ActivityHeartbeat,
        Self::UserTimer,
    ];

    /// Whether this class belongs to an activity.
    #[must_use]
    pub const fn is_activity(self) -> bool {
        matches!(
            self,
            Self::ActivityScheduleToStart
                | Self::ActivityScheduleToClose
                | Self::ActivityStartToClose
                | Self::ActivityHeartbeat
        )
    }

    /// Rank among activity classes on an exact deadline tie; lower wins.
    ///
    /// Non-activity classes rank after every activity class.
    #[must_use]
    pub fn tie_break_rank(self) -> usize {
        ACTIVITY_TIMEOUT_PRIORITY
            .iter()
            .position(|candidate| *candidate == self)
            .unwrap_or(ACTIVITY_TIMEOUT_PRIORITY.len())
    }

    /// Bit used in an activity's timer-task status mask.
    #[must_use]
    pub const fn status_bit(self) -> u8 {
        match self {
            Self::ActivityScheduleToStart => 0b0001,
            Self::ActivityScheduleToClose => 0b0010,
            Self::ActivityStartToClose => 0b0100,
            Self::ActivityHeartbeat => 0b1000,
            Self::DecisionTimeout | Self::UserTimer => 0,
        }
    }

    /// Stable lowercase name, used in logs and persisted records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DecisionTimeout => "decision_timeout",
            Self::ActivityScheduleToStart => "activity_schedule_to_start",
            Self::ActivityScheduleToClose => "activity_schedule_to_close",
            Self::ActivityStartToClose => "activity_start_to_close",
            Self::ActivityHeartbeat => "activity_heartbeat",
            Self::UserTimer => "user_timer",
        }
    }
}

impl std::fmt::Display for TimeoutType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
