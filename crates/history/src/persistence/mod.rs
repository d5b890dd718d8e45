//! Storage boundary of a shard.
//!
//! The timer subsystem consumes two narrow interfaces: a range-readable timer
//! task queue and a conditionally-updatable execution store. Both are
//! implemented in memory and on SurrealDB.

mod client;
mod error;
mod memory;
mod surreal_store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hourglass_core::{ExecutionKey, TimerSequenceId, TimerTask};
use serde::{Deserialize, Serialize};

use crate::mutable_state::MutableState;

pub use client::{Credentials, StoreConfig};
pub use error::{PersistenceError, PersistenceResult, from_surrealdb_error};
pub use memory::InMemoryShardStore;
pub use surreal_store::SurrealShardStore;

/// Opaque continuation token for paged timer task reads.
///
/// Holds the position of the last task returned; the next page starts
/// strictly after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageToken(pub TimerSequenceId);

/// A range read over the timer task queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetTimerTasksRequest {
    /// Inclusive upper bound on visibility timestamps
    pub max_visibility: DateTime<Utc>,
    /// Maximum number of tasks returned
    pub page_size: usize,
    /// Continue after a previous page
    pub next_page_token: Option<PageToken>,
}

impl GetTimerTasksRequest {
    #[must_use]
    pub const fn new(max_visibility: DateTime<Utc>, page_size: usize) -> Self {
        Self {
            max_visibility,
            page_size,
            next_page_token: None,
        }
    }

    #[must_use]
    pub const fn after(mut self, token: Option<PageToken>) -> Self {
        self.next_page_token = token;
        self
    }
}

/// One page of timer tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetTimerTasksResponse {
    /// Tasks ordered by `(visibility_timestamp, task_id)`
    pub timers: Vec<TimerTask>,
    /// Present when more tasks may match the request
    pub next_page_token: Option<PageToken>,
}

impl GetTimerTasksResponse {
    /// Build a response, emitting a token only when the page is full.
    #[must_use]
    pub fn from_page(timers: Vec<TimerTask>, page_size: usize) -> Self {
        let next_page_token = if timers.len() >= page_size {
            timers.last().map(|t| PageToken(t.sequence_id()))
        } else {
            None
        };
        Self {
            timers,
            next_page_token,
        }
    }
}

/// A conditional replace of an execution's state.
#[derive(Debug, Clone)]
pub struct UpdateWorkflowExecutionRequest {
    /// The new state
    pub state: MutableState,
    /// Stored `next_event_id` the update is conditioned on
    pub condition: i64,
    /// Timer tasks persisted in the same write
    pub timer_tasks: Vec<TimerTask>,
}

/// The shard's persisted timer task queue.
#[async_trait]
pub trait TimerTaskStore: Send + Sync {
    /// Read tasks with `visibility_timestamp <= max_visibility` in queue order.
    async fn get_timer_tasks(
        &self,
        request: GetTimerTasksRequest,
    ) -> PersistenceResult<GetTimerTasksResponse>;

    /// Delete a task. Returns `false` if it was already gone.
    async fn delete_timer_task(&self, task_id: i64) -> PersistenceResult<bool>;

    /// Smallest visibility timestamp strictly after `after`.
    async fn earliest_future_deadline(
        &self,
        after: DateTime<Utc>,
    ) -> PersistenceResult<Option<DateTime<Utc>>>;

    /// Largest task ID ever persisted in this shard.
    async fn max_task_id(&self) -> PersistenceResult<i64>;

    /// Persist the processor's ack level.
    async fn update_timer_ack_level(&self, level: TimerSequenceId) -> PersistenceResult<()>;

    /// Last persisted ack level.
    async fn timer_ack_level(&self) -> PersistenceResult<Option<TimerSequenceId>>;
}

/// The shard's workflow execution records.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert a new execution together with its initial timer tasks.
    async fn create_workflow_execution(
        &self,
        state: &MutableState,
        timer_tasks: &[TimerTask],
    ) -> PersistenceResult<()>;

    /// Load an execution, if it exists.
    async fn get_workflow_execution(
        &self,
        key: &ExecutionKey,
    ) -> PersistenceResult<Option<MutableState>>;

    /// Atomically replace the state and append timer tasks if the stored
    /// `next_event_id` equals `request.condition`.
    async fn update_workflow_execution(
        &self,
        request: UpdateWorkflowExecutionRequest,
    ) -> PersistenceResult<()>;
}

/// Both halves of a shard's storage.
pub trait ShardStore: TimerTaskStore + ExecutionStore {}

impl<T: TimerTaskStore + ExecutionStore> ShardStore for T {}
