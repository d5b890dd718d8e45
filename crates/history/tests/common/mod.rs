//! Shared fixtures for timer subsystem integration tests.

#![allow(dead_code)]
#![allow(clippy::unwrap_used, clippy::arithmetic_side_effects, clippy::indexing_slicing)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hourglass_core::{ExecutionKey, ExecutionState, SystemClock, TimerSequenceId, TimerTask};
use hourglass_history::persistence::{
    ExecutionStore, GetTimerTasksRequest, GetTimerTasksResponse, PersistenceResult,
    TimerTaskStore, UpdateWorkflowExecutionRequest,
};
use hourglass_history::{
    HistoryConfig, HistoryEngine, InMemoryShardStore, MutableState, ScheduleActivityAttributes,
    ShardContext, ShardStore, StartTimerAttributes, TimerQueueConfig, TimerQueueProcessor,
};
use parking_lot::Mutex;

pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

pub const IDENTITY: &str = "test-worker";

/// A shard wired to an in-memory store, an engine and a processor.
pub struct Harness {
    pub store: InMemoryShardStore,
    pub shard: Arc<ShardContext>,
    pub engine: HistoryEngine,
    pub processor: Arc<TimerQueueProcessor>,
    pub key: ExecutionKey,
}

/// Queue tuning with short backoffs so failure paths finish quickly.
pub fn fast_config() -> TimerQueueConfig {
    let mut config = TimerQueueConfig::default();
    config.deferred_task_backoff_ms = 200;
    config.retry = hourglass_history::RetryPolicy::new(5, 10, 50);
    config
}

pub fn harness_with(config: TimerQueueConfig, store: InMemoryShardStore) -> Harness {
    let history_config = HistoryConfig {
        timer_queue: config,
        ..HistoryConfig::default()
    };
    let shard = Arc::new(ShardContext::new(history_config, Arc::new(SystemClock), 0));
    let shared: Arc<dyn ShardStore> = Arc::new(store.clone());
    let engine = HistoryEngine::new(Arc::clone(&shard), Arc::clone(&shared));
    let processor = Arc::new(TimerQueueProcessor::new(Arc::clone(&shard), shared));
    engine.set_timer_notifier(processor.clone());
    Harness {
        store,
        shard,
        engine,
        processor,
        key: unique_key(),
    }
}

pub fn harness() -> Harness {
    harness_with(fast_config(), InMemoryShardStore::new())
}

pub fn unique_key() -> ExecutionKey {
    ExecutionKey::new(
        "test-domain",
        format!("wf-{}", uuid::Uuid::new_v4()),
        uuid::Uuid::new_v4().to_string(),
    )
}

/// Poll until the processor has deleted `expected` tasks.
pub async fn wait_for_fired(processor: &TimerQueueProcessor, expected: u64, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if processor.fired_count() >= expected {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

impl Harness {
    pub async fn start_workflow(&self) -> TestResult<MutableState> {
        Ok(self
            .engine
            .start_workflow(self.key.clone(), "test-workflow", "test-task-list", 100, 10)
            .await?)
    }

    pub async fn state(&self) -> TestResult<MutableState> {
        Ok(self.engine.get_workflow(&self.key).await?)
    }

    /// Start and complete the first decision, returning the completed event ID.
    pub async fn complete_first_decision(&self) -> TestResult<i64> {
        let schedule_id = self
            .state()
            .await?
            .pending_decision()
            .map(|d| d.schedule_id)
            .ok_or("no pending decision")?;
        self.engine.start_decision(&self.key, schedule_id, IDENTITY).await?;
        Ok(self
            .engine
            .complete_decision(&self.key, schedule_id, IDENTITY)
            .await?
            .result)
    }

    /// Start a workflow and add `timers` with a single builder.
    ///
    /// Returns the timer tasks persisted with them.
    pub async fn create_execution_with_timers(
        &self,
        timers: &[(&str, i64)],
    ) -> TestResult<Vec<TimerTask>> {
        self.start_workflow().await?;
        let completed_id = self.complete_first_decision().await?;
        let now = Utc::now();
        let mutation = self
            .engine
            .update_workflow(&self.key, |state, builder| {
                for (timer_id, secs) in timers {
                    let timer = state.add_timer_started_event(
                        now,
                        completed_id,
                        &StartTimerAttributes::new(*timer_id, *secs),
                    )?;
                    builder.add_user_timer(&timer, state);
                }
                builder.get_user_timer_task_if_needed(state);
                Ok(())
            })
            .await?;
        Ok(mutation.timer_tasks)
    }

    /// Persist a decision timeout task for a decision that is completed in the same write.
    pub async fn add_decision_timer(&self) -> TestResult<Vec<TimerTask>> {
        let now = Utc::now();
        let mutation = self
            .engine
            .update_workflow(&self.key, |state, builder| {
                let scheduled = match state.pending_decision() {
                    Some(decision) => decision.clone(),
                    None => state.add_decision_task_scheduled_event(now, 0)?,
                };
                let started =
                    state.add_decision_task_started_event(now, scheduled.schedule_id, IDENTITY)?;
                builder.add_decision_timeout_task(started.schedule_id, started.attempt, 1)?;
                state.add_decision_task_completed_event(now, started.schedule_id, IDENTITY)?;
                Ok(())
            })
            .await?;
        Ok(mutation.timer_tasks)
    }

    pub async fn add_user_timer(&self, timer_id: &str, secs: i64) -> TestResult<Vec<TimerTask>> {
        let mutation = self
            .engine
            .start_user_timer(
                &self.key,
                hourglass_core::EMPTY_EVENT_ID,
                StartTimerAttributes::new(timer_id, secs),
            )
            .await?;
        Ok(mutation.timer_tasks)
    }

    /// Schedule and start an activity whose only timeout is a heartbeat.
    pub async fn add_heartbeat_timer(
        &self,
        activity_id: &str,
        secs: i32,
    ) -> TestResult<Vec<TimerTask>> {
        let now = Utc::now();
        let mutation = self
            .engine
            .update_workflow(&self.key, |state, builder| {
                let activity = state.add_activity_task_scheduled_event(
                    now,
                    hourglass_core::EMPTY_EVENT_ID,
                    &ScheduleActivityAttributes::new(activity_id).heartbeat(secs),
                )?;
                state.add_activity_task_started_event(now, activity.schedule_id, "request")?;
                builder.get_activity_timer_task_if_needed(state);
                Ok(())
            })
            .await?;
        Ok(mutation.timer_tasks)
    }

    /// Close the execution without recording history.
    pub async fn close_workflow(&self) -> TestResult {
        self.engine
            .update_workflow(&self.key, |state, _| {
                state.close_as(ExecutionState::Completed);
                Ok(())
            })
            .await?;
        Ok(())
    }
}

/// Store wrapper recording the order in which tasks are deleted.
#[derive(Clone, Default)]
pub struct DeleteRecordingStore {
    pub inner: InMemoryShardStore,
    pub deleted: Arc<Mutex<Vec<i64>>>,
}

#[async_trait]
impl TimerTaskStore for DeleteRecordingStore {
    async fn get_timer_tasks(
        &self,
        request: GetTimerTasksRequest,
    ) -> PersistenceResult<GetTimerTasksResponse> {
        self.inner.get_timer_tasks(request).await
    }

    async fn delete_timer_task(&self, task_id: i64) -> PersistenceResult<bool> {
        self.deleted.lock().push(task_id);
        self.inner.delete_timer_task(task_id).await
    }

    async fn earliest_future_deadline(
        &self,
        after: DateTime<Utc>,
    ) -> PersistenceResult<Option<DateTime<Utc>>> {
        self.inner.earliest_future_deadline(after).await
    }

    async fn max_task_id(&self) -> PersistenceResult<i64> {
        self.inner.max_task_id().await
    }

    async fn update_timer_ack_level(&self, level: TimerSequenceId) -> PersistenceResult<()> {
        self.inner.update_timer_ack_level(level).await
    }

    async fn timer_ack_level(&self) -> PersistenceResult<Option<TimerSequenceId>> {
        self.inner.timer_ack_level().await
    }
}

#[async_trait]
impl ExecutionStore for DeleteRecordingStore {
    async fn create_workflow_execution(
        &self,
        state: &MutableState,
        timer_tasks: &[TimerTask],
    ) -> PersistenceResult<()> {
        self.inner.create_workflow_execution(state, timer_tasks).await
    }

    async fn get_workflow_execution(
        &self,
        key: &ExecutionKey,
    ) -> PersistenceResult<Option<MutableState>> {
        self.inner.get_workflow_execution(key).await
    }

    async fn update_workflow_execution(
        &self,
        request: UpdateWorkflowExecutionRequest,
    ) -> PersistenceResult<()> {
        self.inner.update_workflow_execution(request).await
    }
}
