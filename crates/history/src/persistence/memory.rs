//! In-memory shard store.
//!
//! Holds executions and timer tasks behind a single lock so a conditional
//! update and its timer tasks land atomically. Failure hooks let tests
//! exercise the processor's retry paths.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hourglass_core::{ExecutionKey, TimerSequenceId, TimerTask};
use parking_lot::Mutex;

use super::error::{PersistenceError, PersistenceResult};
use super::{
    ExecutionStore, GetTimerTasksRequest, GetTimerTasksResponse, TimerTaskStore,
    UpdateWorkflowExecutionRequest,
};
use crate::error::EXECUTION_ENTITY;
use crate::mutable_state::MutableState;

#[derive(Debug, Default)]
struct ShardData {
    executions: HashMap<String, MutableState>,
    timers: BTreeMap<TimerSequenceId, TimerTask>,
    ack_level: Option<TimerSequenceId>,
    max_task_id: i64,
}

impl ShardData {
    fn insert_timers(&mut self, tasks: &[TimerTask]) {
        for task in tasks {
            self.max_task_id = self.max_task_id.max(task.task_id);
            self.timers.insert(task.sequence_id(), task.clone());
        }
    }
}

#[derive(Debug, Default)]
struct FailureHooks {
    timer_reads: AtomicU32,
    timer_deletes: AtomicU32,
    execution_reads: AtomicU32,
    update_conflicts: AtomicU32,
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Shard store kept entirely in process memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryShardStore {
    data: Arc<Mutex<ShardData>>,
    hooks: Arc<FailureHooks>,
}

impl InMemoryShardStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` timer task reads fail with a transient error.
    pub fn fail_next_timer_reads(&self, n: u32) {
        self.hooks.timer_reads.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` timer task deletes fail with a transient error.
    pub fn fail_next_timer_deletes(&self, n: u32) {
        self.hooks.timer_deletes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` execution loads fail with a transient error.
    pub fn fail_next_execution_reads(&self, n: u32) {
        self.hooks.execution_reads.store(n, Ordering::SeqCst);
    }

    /// Reject the next `n` conditional updates as if another writer won.
    pub fn conflict_next_updates(&self, n: u32) {
        self.hooks.update_conflicts.store(n, Ordering::SeqCst);
    }

    /// All queued timer tasks in queue order.
    #[must_use]
    pub fn timer_tasks(&self) -> Vec<TimerTask> {
        self.data.lock().timers.values().cloned().collect()
    }

    /// Number of queued timer tasks.
    #[must_use]
    pub fn timer_task_count(&self) -> usize {
        self.data.lock().timers.len()
    }

    /// Re-insert a task as if the queue redelivered it.
    pub fn redeliver(&self, task: TimerTask) {
        self.data.lock().insert_timers(std::slice::from_ref(&task));
    }
}

#[async_trait]
impl TimerTaskStore for InMemoryShardStore {
    async fn get_timer_tasks(
        &self,
        request: GetTimerTasksRequest,
    ) -> PersistenceResult<GetTimerTasksResponse> {
        if take_one(&self.hooks.timer_reads) {
            return Err(PersistenceError::query("injected timer read failure"));
        }
        let lower = request
            .next_page_token
            .map_or(Bound::Unbounded, |token| Bound::Excluded(token.0));
        let data = self.data.lock();
        let timers: Vec<TimerTask> = data
            .timers
            .range((lower, Bound::Unbounded))
            .map(|(_, task)| task)
            .take_while(|task| task.visibility_timestamp <= request.max_visibility)
            .take(request.page_size)
            .cloned()
            .collect();
        Ok(GetTimerTasksResponse::from_page(timers, request.page_size))
    }

    async fn delete_timer_task(&self, task_id: i64) -> PersistenceResult<bool> {
        if take_one(&self.hooks.timer_deletes) {
            return Err(PersistenceError::timed_out(0));
        }
        let mut data = self.data.lock();
        let key = data
            .timers
            .iter()
            .find(|(_, task)| task.task_id == task_id)
            .map(|(key, _)| *key);
        Ok(key.and_then(|k| data.timers.remove(&k)).is_some())
    }

    async fn earliest_future_deadline(
        &self,
        after: DateTime<Utc>,
    ) -> PersistenceResult<Option<DateTime<Utc>>> {
        Ok(self
            .data
            .lock()
            .timers
            .keys()
            .map(|seq| seq.visibility_timestamp)
            .find(|vis| *vis > after))
    }

    async fn max_task_id(&self) -> PersistenceResult<i64> {
        Ok(self.data.lock().max_task_id)
    }

    async fn update_timer_ack_level(&self, level: TimerSequenceId) -> PersistenceResult<()> {
        let mut data = self.data.lock();
        if data.ack_level.is_none_or(|current| current < level) {
            data.ack_level = Some(level);
        }
        Ok(())
    }

    async fn timer_ack_level(&self) -> PersistenceResult<Option<TimerSequenceId>> {
        Ok(self.data.lock().ack_level)
    }
}

#[async_trait]
impl ExecutionStore for InMemoryShardStore {
    async fn create_workflow_execution(
        &self,
        state: &MutableState,
        timer_tasks: &[TimerTask],
    ) -> PersistenceResult<()> {
        let key = state.key().storage_key();
        let mut data = self.data.lock();
        if data.executions.contains_key(&key) {
            return Err(PersistenceError::duplicate(EXECUTION_ENTITY, key));
        }
        data.executions.insert(key, state.clone());
        data.insert_timers(timer_tasks);
        Ok(())
    }

    async fn get_workflow_execution(
        &self,
        key: &ExecutionKey,
    ) -> PersistenceResult<Option<MutableState>> {
        if take_one(&self.hooks.execution_reads) {
            return Err(PersistenceError::unavailable(
                "injected execution read failure",
            ));
        }
        Ok(self.data.lock().executions.get(&key.storage_key()).cloned())
    }

    async fn update_workflow_execution(
        &self,
        request: UpdateWorkflowExecutionRequest,
    ) -> PersistenceResult<()> {
        let key = request.state.key().storage_key();
        let mut data = self.data.lock();
        let actual = data
            .executions
            .get(&key)
            .map(MutableState::next_event_id)
            .ok_or_else(|| PersistenceError::not_found(EXECUTION_ENTITY, key.clone()))?;
        if take_one(&self.hooks.update_conflicts) {
            return Err(PersistenceError::condition_failed(
                request.condition,
                actual.saturating_add(1),
            ));
        }
        if actual != request.condition {
            return Err(PersistenceError::condition_failed(request.condition, actual));
        }
        data.executions.insert(key, request.state);
        data.insert_timers(&request.timer_tasks);
        Ok(())
    }
}
