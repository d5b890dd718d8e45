//! # hourglass-core
//!
//! Shared types for the hourglass timer subsystem: timeout classes, timer
//! tasks, execution identity, history events, clocks, and errors.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod clock;
pub mod error;
pub mod event;
pub mod execution;
pub mod task;
pub mod timeout;

pub use clock::{Clock, ManualClock, SystemClock, deadline_after};
pub use error::Error;
pub use event::{EMPTY_EVENT_ID, EventAttributes, FIRST_EVENT_ID, HistoryEvent};
pub use execution::{ExecutionKey, ExecutionState};
pub use task::{TimerSequenceId, TimerTask, UNASSIGNED_TASK_ID, earliest_visibility};
pub use timeout::{ACTIVITY_TIMEOUT_PRIORITY, TimeoutType};
