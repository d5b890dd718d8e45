//! Write path for workflow executions.
//!
//! Every mutation follows the same cycle: load the execution, mutate it with
//! a fresh [`TimerBuilder`], assign IDs to the emitted timer tasks, and
//! persist state and tasks in one conditional update keyed on the loaded
//! `next_event_id`. A conflict reloads and reruns the mutation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hourglass_core::{EMPTY_EVENT_ID, ExecutionKey, TimerTask};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{HistoryError, HistoryResult};
use crate::mutable_state::{MutableState, ScheduleActivityAttributes, StartTimerAttributes};
use crate::persistence::{PersistenceError, ShardStore, UpdateWorkflowExecutionRequest};
use crate::shard::ShardContext;
use crate::timer_builder::TimerBuilder;

/// Receives timer tasks right after they are persisted.
pub trait TimerNotifier: Send + Sync {
    fn notify_new_timers(&self, tasks: &[TimerTask]);
}

/// Retry bookkeeping of one mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateStats {
    pub conflicts: u32,
    pub storage_retries: u32,
}

/// Result of a mutation.
#[derive(Debug, Clone)]
pub struct Mutation<R> {
    /// Value returned by the mutation closure
    pub result: R,
    /// Timer tasks persisted with the state
    pub timer_tasks: Vec<TimerTask>,
    /// Whether anything was written
    pub persisted: bool,
}

/// Load, mutate and conditionally persist one execution.
///
/// The closure may run more than once when a concurrent writer wins the
/// conditional update. When it leaves the state untouched and emits no
/// timer task nothing is written.
///
/// # Errors
///
/// Returns `WorkflowNotFound` for a missing execution, the closure's own
/// error, `ConditionalUpdateConflict` once conflict retries are exhausted,
/// or `TransientStorage` once storage retries are exhausted.
pub async fn update_execution<R, F>(
    shard: &ShardContext,
    store: &dyn ShardStore,
    key: &ExecutionKey,
    stats: &mut UpdateStats,
    mut mutate: F,
) -> HistoryResult<Mutation<R>>
where
    F: FnMut(&mut MutableState, &mut TimerBuilder) -> HistoryResult<R> + Send,
    R: Send,
{
    let queue_config = &shard.config().timer_queue;
    let retry = queue_config.retry;
    let max_conflict_retries = queue_config.max_conflict_retries;

    loop {
        let loaded = retry
            .run(
                "get_workflow_execution",
                PersistenceError::is_retryable,
                || stats.storage_retries = stats.storage_retries.saturating_add(1),
                || store.get_workflow_execution(key),
            )
            .await?;
        let Some(mut state) = loaded else {
            return Err(HistoryError::workflow_not_found(key));
        };

        let condition = state.next_event_id();
        let original = state.clone();
        let mut builder = TimerBuilder::new(key.clone(), shard.clock());
        let result = mutate(&mut state, &mut builder)?;
        let mut timer_tasks = builder.take_tasks();

        if state == original && timer_tasks.is_empty() {
            return Ok(Mutation {
                result,
                timer_tasks,
                persisted: false,
            });
        }

        shard.allocate_task_ids(&mut timer_tasks);
        let request = UpdateWorkflowExecutionRequest {
            state,
            condition,
            timer_tasks: timer_tasks.clone(),
        };
        let written = retry
            .run(
                "update_workflow_execution",
                PersistenceError::is_retryable,
                || stats.storage_retries = stats.storage_retries.saturating_add(1),
                || store.update_workflow_execution(request.clone()),
            )
            .await;

        match written.map_err(HistoryError::from) {
            Ok(()) => {
                return Ok(Mutation {
                    result,
                    timer_tasks,
                    persisted: true,
                });
            }
            Err(err) if err.is_conflict() => {
                stats.conflicts = stats.conflicts.saturating_add(1);
                if stats.conflicts > max_conflict_retries {
                    return Err(err);
                }
                warn!(
                    shard_id = shard.shard_id(),
                    workflow_id = %key.workflow_id,
                    attempt = stats.conflicts,
                    error = %err,
                    "conditional update conflict, reloading"
                );
            }
            Err(err) => return Err(err),
        }
    }
}

/// Event-sourcing front of one shard.
pub struct HistoryEngine {
    shard: Arc<ShardContext>,
    store: Arc<dyn ShardStore>,
    notifier: RwLock<Option<Arc<dyn TimerNotifier>>>,
}

impl std::fmt::Debug for HistoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryEngine")
            .field("shard_id", &self.shard.shard_id())
            .finish_non_exhaustive()
    }
}

impl HistoryEngine {
    #[must_use]
    pub fn new(shard: Arc<ShardContext>, store: Arc<dyn ShardStore>) -> Self {
        Self {
            shard,
            store,
            notifier: RwLock::new(None),
        }
    }

    /// Route newly persisted timer tasks to `notifier`.
    pub fn set_timer_notifier(&self, notifier: Arc<dyn TimerNotifier>) {
        *self.notifier.write() = Some(notifier);
    }

    #[must_use]
    pub fn shard(&self) -> &Arc<ShardContext> {
        &self.shard
    }

    fn now(&self) -> DateTime<Utc> {
        self.shard.clock().now()
    }

    fn notify(&self, tasks: &[TimerTask]) {
        if tasks.is_empty() {
            return;
        }
        let notifier = self.notifier.read().clone();
        if let Some(notifier) = notifier {
            notifier.notify_new_timers(tasks);
        }
    }

    /// Create an execution and schedule its first decision.
    ///
    /// # Errors
    ///
    /// Returns an error if a timeout is not positive or the execution exists.
    pub async fn start_workflow(
        &self,
        key: ExecutionKey,
        workflow_type: &str,
        task_list: &str,
        execution_timeout_secs: i32,
        decision_timeout_secs: i32,
    ) -> HistoryResult<MutableState> {
        let now = self.now();
        let mut state = MutableState::new(key, workflow_type, task_list);
        state.add_workflow_execution_started_event(
            now,
            execution_timeout_secs,
            decision_timeout_secs,
        )?;
        state.add_decision_task_scheduled_event(now, 0)?;
        self.store.create_workflow_execution(&state, &[]).await?;
        debug!(
            shard_id = self.shard.shard_id(),
            execution = %state.key(),
            "workflow execution started"
        );
        Ok(state)
    }

    /// Load an execution.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowNotFound` if it does not exist.
    pub async fn get_workflow(&self, key: &ExecutionKey) -> HistoryResult<MutableState> {
        self.store
            .get_workflow_execution(key)
            .await?
            .ok_or_else(|| HistoryError::workflow_not_found(key))
    }

    /// Run `mutate` against the execution and persist the result with its timer tasks.
    ///
    /// # Errors
    ///
    /// See [`update_execution`].
    pub async fn update_workflow<R, F>(&self, key: &ExecutionKey, mutate: F) -> HistoryResult<Mutation<R>>
    where
        F: FnMut(&mut MutableState, &mut TimerBuilder) -> HistoryResult<R> + Send,
        R: Send,
    {
        let mut stats = UpdateStats::default();
        let mutation =
            update_execution(&self.shard, self.store.as_ref(), key, &mut stats, mutate).await?;
        self.notify(&mutation.timer_tasks);
        Ok(mutation)
    }

    /// Start the pending decision and arm its timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if no matching decision is pending.
    pub async fn start_decision(
        &self,
        key: &ExecutionKey,
        schedule_id: i64,
        identity: &str,
    ) -> HistoryResult<Mutation<i64>> {
        let now = self.now();
        self.update_workflow(key, |state, builder| {
            let decision = state.add_decision_task_started_event(now, schedule_id, identity)?;
            builder.add_decision_timeout_task(
                decision.schedule_id,
                decision.attempt,
                decision.timeout_secs,
            )?;
            Ok(decision.started_id)
        })
        .await
    }

    /// Complete the started decision, returning the completed event ID.
    ///
    /// # Errors
    ///
    /// Returns an error if no matching started decision is pending.
    pub async fn complete_decision(
        &self,
        key: &ExecutionKey,
        schedule_id: i64,
        identity: &str,
    ) -> HistoryResult<Mutation<i64>> {
        let now = self.now();
        self.update_workflow(key, |state, _| {
            state.add_decision_task_completed_event(now, schedule_id, identity)
        })
        .await
    }

    /// Start a user timer.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for a non-positive timeout, or an error if the timer ID is in use.
    pub async fn start_user_timer(
        &self,
        key: &ExecutionKey,
        decision_completed_id: i64,
        attributes: StartTimerAttributes,
    ) -> HistoryResult<Mutation<i64>> {
        attributes.validate()?;
        let now = self.now();
        self.update_workflow(key, |state, builder| {
            let timer = state.add_timer_started_event(now, decision_completed_id, &attributes)?;
            builder.add_user_timer(&timer, state);
            builder.get_user_timer_task_if_needed(state);
            Ok(timer.started_id)
        })
        .await
    }

    /// Cancel a user timer.
    ///
    /// # Errors
    ///
    /// Returns an error if the timer is not pending.
    pub async fn cancel_user_timer(
        &self,
        key: &ExecutionKey,
        timer_id: &str,
    ) -> HistoryResult<Mutation<i64>> {
        let now = self.now();
        self.update_workflow(key, |state, builder| {
            let event_id = state.add_timer_canceled_event(now, timer_id)?;
            builder.get_user_timer_task_if_needed(state);
            Ok(event_id)
        })
        .await
    }

    /// Schedule an activity after validating its timeouts.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the timeouts cannot be completed.
    pub async fn schedule_activity(
        &self,
        key: &ExecutionKey,
        decision_completed_id: i64,
        attributes: ScheduleActivityAttributes,
    ) -> HistoryResult<Mutation<i64>> {
        let attributes = attributes.validated()?;
        let now = self.now();
        self.update_workflow(key, |state, builder| {
            let activity =
                state.add_activity_task_scheduled_event(now, decision_completed_id, &attributes)?;
            builder.get_activity_timer_task_if_needed(state);
            Ok(activity.schedule_id)
        })
        .await
    }

    /// Record that a worker started the activity.
    ///
    /// # Errors
    ///
    /// Returns an error if the activity is not pending or already started.
    pub async fn record_activity_started(
        &self,
        key: &ExecutionKey,
        schedule_id: i64,
        request_id: &str,
    ) -> HistoryResult<Mutation<i64>> {
        let now = self.now();
        self.update_workflow(key, |state, builder| {
            let activity = state.add_activity_task_started_event(now, schedule_id, request_id)?;
            builder.get_activity_timer_task_if_needed(state);
            Ok(activity.started_id)
        })
        .await
    }

    /// Record an activity heartbeat.
    ///
    /// # Errors
    ///
    /// Returns an error if the activity is not pending and started.
    pub async fn record_activity_heartbeat(
        &self,
        key: &ExecutionKey,
        schedule_id: i64,
    ) -> HistoryResult<Mutation<()>> {
        let now = self.now();
        self.update_workflow(key, |state, _| {
            state.record_activity_heartbeat(now, schedule_id)
        })
        .await
    }

    /// Complete a started activity and schedule a decision if none is pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the activity is not pending and started.
    pub async fn complete_activity(
        &self,
        key: &ExecutionKey,
        schedule_id: i64,
        identity: &str,
    ) -> HistoryResult<Mutation<i64>> {
        let now = self.now();
        self.update_workflow(key, |state, builder| {
            let event_id = state.add_activity_task_completed_event(now, schedule_id, identity)?;
            if state.pending_decision().is_none() {
                state.add_decision_task_scheduled_event(now, 0)?;
            }
            builder.get_activity_timer_task_if_needed(state);
            Ok(event_id)
        })
        .await
    }

    /// Complete the execution.
    ///
    /// # Errors
    ///
    /// Returns an error if the execution is already closed.
    pub async fn complete_workflow(
        &self,
        key: &ExecutionKey,
        decision_completed_id: Option<i64>,
    ) -> HistoryResult<Mutation<i64>> {
        let now = self.now();
        let completed_by = decision_completed_id.unwrap_or(EMPTY_EVENT_ID);
        self.update_workflow(key, |state, _| {
            state.add_workflow_execution_completed_event(now, completed_by)
        })
        .await
    }
}
