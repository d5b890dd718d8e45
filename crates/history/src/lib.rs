//! # hourglass-history
//!
//! Timer subsystem of a shard of the history service.
//!
//! - [`HistoryEngine`] mutates workflow executions and persists the timer
//!   tasks a [`TimerBuilder`] derives from each mutation.
//! - [`TimerQueueProcessor`] drains due tasks, applies their timeouts and
//!   deletes them.
//! - [`TimerGate`] wakes the processor at the next deadline.
//!
//! Storage goes through [`ShardStore`], implemented in memory and on SurrealDB.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod config;
pub mod engine;
pub mod error;
pub mod mutable_state;
pub mod persistence;
pub mod processor;
pub mod retry;
pub mod shard;
pub mod telemetry;
pub mod timer_builder;
pub mod timer_gate;

pub use config::{HistoryConfig, TimerQueueConfig};
pub use engine::{HistoryEngine, Mutation, TimerNotifier, UpdateStats, update_execution};
pub use error::{HistoryError, HistoryResult};
pub use mutable_state::{
    ActivityInfo, DecisionInfo, ExecutionInfo, MutableState, ScheduleActivityAttributes,
    StartTimerAttributes, TimerInfo,
};
pub use persistence::{InMemoryShardStore, ShardStore, StoreConfig, SurrealShardStore};
pub use processor::{MetricsSnapshot, ProcessorState, TimerQueueMetrics, TimerQueueProcessor};
pub use retry::RetryPolicy;
pub use shard::ShardContext;
pub use telemetry::init_tracing;
pub use timer_builder::{ActivityDeadline, TimerBuilder, nearest_activity_deadline};
pub use timer_gate::{GateEvent, TimerGate};
