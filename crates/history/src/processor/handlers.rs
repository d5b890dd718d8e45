//! Per-class timeout handlers.
//!
//! Each handler re-checks the task against the current execution state
//! before applying anything. A task that no longer matches is stale and is
//! deleted without mutating the workflow.

use chrono::{DateTime, Utc};
use hourglass_core::{TimeoutType, TimerTask};
use itertools::Itertools;
use tracing::debug;

use crate::engine::{UpdateStats, update_execution};
use crate::error::{HistoryError, HistoryResult};
use crate::mutable_state::MutableState;
use crate::persistence::ShardStore;
use crate::shard::ShardContext;
use crate::timer_builder::TimerBuilder;

/// What processing a task did to its workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskOutcome {
    /// At least one timeout was recorded
    Applied { timeouts: u32 },
    /// The task no longer matched state
    Stale,
    /// The execution is closed
    Closed,
    /// The execution does not exist
    NotFound,
}

/// Result of applying one task: its outcome and the follow-up tasks persisted with it.
#[derive(Debug)]
pub(crate) struct Applied {
    pub outcome: TaskOutcome,
    pub new_tasks: Vec<TimerTask>,
}

pub(crate) async fn apply_timer_task(
    shard: &ShardContext,
    store: &dyn ShardStore,
    task: &TimerTask,
    stats: &mut UpdateStats,
) -> HistoryResult<Applied> {
    let clock = shard.clock();
    let mutation = update_execution(shard, store, &task.execution, stats, |state, builder| {
        if !state.is_running() {
            return Ok(TaskOutcome::Closed);
        }
        let now = clock.now();
        let reference = now.max(task.visibility_timestamp);
        match task.timeout_type {
            TimeoutType::UserTimer => fire_user_timers(state, builder, now, reference),
            TimeoutType::DecisionTimeout => time_out_decision(state, task, now),
            TimeoutType::ActivityScheduleToStart
            | TimeoutType::ActivityScheduleToClose
            | TimeoutType::ActivityStartToClose
            | TimeoutType::ActivityHeartbeat => {
                time_out_activities(state, builder, task, now, reference)
            }
        }
    })
    .await;

    match mutation {
        Ok(mutation) => Ok(Applied {
            outcome: mutation.result,
            new_tasks: mutation.timer_tasks,
        }),
        Err(err) if err.is_benign() => {
            debug!(task_id = task.task_id, error = %err, "timer task discarded");
            let outcome = match err {
                HistoryError::WorkflowNotFound { .. } => TaskOutcome::NotFound,
                HistoryError::WorkflowTerminal { .. } => TaskOutcome::Closed,
                _ => TaskOutcome::Stale,
            };
            Ok(Applied {
                outcome,
                new_tasks: Vec::new(),
            })
        }
        Err(err) => Err(err),
    }
}

fn schedule_decision_if_needed(state: &mut MutableState, now: DateTime<Utc>) -> HistoryResult<()> {
    if state.pending_decision().is_none() {
        state.add_decision_task_scheduled_event(now, 0)?;
    }
    Ok(())
}

fn timeouts(count: usize) -> TaskOutcome {
    if count == 0 {
        TaskOutcome::Stale
    } else {
        TaskOutcome::Applied {
            timeouts: u32::try_from(count).unwrap_or(u32::MAX),
        }
    }
}

/// Fire every user timer due at `reference`, then arm the next one.
fn fire_user_timers(
    state: &mut MutableState,
    builder: &mut TimerBuilder,
    now: DateTime<Utc>,
    reference: DateTime<Utc>,
) -> HistoryResult<TaskOutcome> {
    let due: Vec<String> = state
        .pending_user_timers()
        .filter(|t| t.expiry_time <= reference)
        .sorted_by_key(|t| (t.expiry_time, t.started_id))
        .map(|t| t.timer_id.clone())
        .collect();

    for timer_id in &due {
        state.add_timer_fired_event(now, timer_id)?;
    }
    builder.get_user_timer_task_if_needed(state);
    if !due.is_empty() {
        schedule_decision_if_needed(state, now)?;
    }
    Ok(timeouts(due.len()))
}

/// Time out the decision the task was created for, rescheduling it with a bumped attempt.
fn time_out_decision(
    state: &mut MutableState,
    task: &TimerTask,
    now: DateTime<Utc>,
) -> HistoryResult<TaskOutcome> {
    let matches = state.pending_decision().is_some_and(|d| {
        d.schedule_id == task.event_id && d.is_started() && d.attempt == task.attempt
    });
    if !matches {
        return Err(HistoryError::stale(task.task_id, "decision already resolved"));
    }
    let timed_out = state.add_decision_task_timed_out_event(now)?;
    state.add_decision_task_scheduled_event(now, timed_out.attempt.saturating_add(1))?;
    Ok(timeouts(1))
}

/// Time out every activity whose earliest deadline has passed, then arm the next deadline.
fn time_out_activities(
    state: &mut MutableState,
    builder: &mut TimerBuilder,
    task: &TimerTask,
    now: DateTime<Utc>,
    reference: DateTime<Utc>,
) -> HistoryResult<TaskOutcome> {
    state.clear_activity_timer_task(task.event_id, task.timeout_type);

    let expired: Vec<(i64, TimeoutType)> = state
        .pending_activities()
        .filter_map(|ai| {
            ai.pending_deadlines()
                .first()
                .filter(|(deadline, _)| *deadline <= reference)
                .map(|(_, timeout_type)| (ai.schedule_id, *timeout_type))
        })
        .collect();

    for (schedule_id, timeout_type) in &expired {
        state.add_activity_task_timed_out_event(now, *schedule_id, *timeout_type)?;
    }
    builder.get_activity_timer_task_if_needed(state);
    if !expired.is_empty() {
        schedule_decision_if_needed(state, now)?;
    }
    Ok(timeouts(expired.len()))
}
