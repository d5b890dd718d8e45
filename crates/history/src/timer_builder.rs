//! Turns workflow state mutations into timer tasks.
//!
//! A builder lives for one mutation of one execution. It emits at most one
//! task per timeout class and skips deadlines already covered by a task that
//! was persisted earlier: user timers carry a `task_created` flag, activities
//! a per-class status bitmask. Every emitted task is also kept so the write
//! path can persist them together with the state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hourglass_core::{Clock, ExecutionKey, TimeoutType, TimerTask, deadline_after};

use crate::error::{HistoryError, HistoryResult};
use crate::mutable_state::{ActivityInfo, MutableState, TimerInfo};

/// Earliest deadline across all pending activities of an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityDeadline {
    pub schedule_id: i64,
    pub activity_id: String,
    pub attempt: i64,
    pub timeout_type: TimeoutType,
    pub deadline: DateTime<Utc>,
    /// A persisted task already covers this deadline
    pub covered: bool,
}

/// Nearest activity deadline in `state`, ties broken by class priority then schedule ID.
#[must_use]
pub fn nearest_activity_deadline(state: &MutableState) -> Option<ActivityDeadline> {
    state
        .pending_activities()
        .filter_map(|ai| {
            ai.pending_deadlines()
                .first()
                .map(|(deadline, timeout_type)| ActivityDeadline {
                    schedule_id: ai.schedule_id,
                    activity_id: ai.activity_id.clone(),
                    attempt: ai.attempt,
                    timeout_type: *timeout_type,
                    deadline: *deadline,
                    covered: ai.has_timer_task(*timeout_type),
                })
        })
        .min_by(|a, b| {
            a.deadline
                .cmp(&b.deadline)
                .then(a.timeout_type.tie_break_rank().cmp(&b.timeout_type.tie_break_rank()))
                .then(a.schedule_id.cmp(&b.schedule_id))
        })
}

/// Per-mutation timer task builder.
#[derive(Debug)]
pub struct TimerBuilder {
    execution: ExecutionKey,
    clock: Arc<dyn Clock>,
    user_timers: Vec<TimerInfo>,
    user_timers_loaded: bool,
    new_tasks: Vec<TimerTask>,
}

impl TimerBuilder {
    #[must_use]
    pub fn new(execution: ExecutionKey, clock: Arc<dyn Clock>) -> Self {
        Self {
            execution,
            clock,
            user_timers: Vec::new(),
            user_timers_loaded: false,
            new_tasks: Vec::new(),
        }
    }

    /// Tasks emitted so far, leaving the builder empty.
    pub fn take_tasks(&mut self) -> Vec<TimerTask> {
        std::mem::take(&mut self.new_tasks)
    }

    /// Tasks emitted so far.
    #[must_use]
    pub fn tasks(&self) -> &[TimerTask] {
        &self.new_tasks
    }

    fn emit(&mut self, task: TimerTask) -> TimerTask {
        self.new_tasks.push(task.clone());
        task
    }

    /// Create the decision timeout task for a started decision.
    ///
    /// # Errors
    ///
    /// Returns `HistoryError::Configuration` if `timeout_secs` is not positive.
    pub fn add_decision_timeout_task(
        &mut self,
        schedule_id: i64,
        attempt: i64,
        timeout_secs: i32,
    ) -> HistoryResult<TimerTask> {
        if timeout_secs <= 0 {
            return Err(HistoryError::configuration(format!(
                "decision {schedule_id} has non-positive timeout {timeout_secs}"
            )));
        }
        let visibility = deadline_after(self.clock.now(), i64::from(timeout_secs)).ok_or_else(|| {
            HistoryError::configuration(format!(
                "decision {schedule_id} timeout {timeout_secs} is out of range"
            ))
        })?;
        let task = TimerTask::new(
            self.execution.clone(),
            TimeoutType::DecisionTimeout,
            visibility,
            schedule_id,
        )
        .with_attempt(attempt);
        Ok(self.emit(task))
    }

    fn load_user_timers(&mut self, state: &MutableState) {
        if self.user_timers_loaded {
            return;
        }
        self.user_timers = state.pending_user_timers().cloned().collect();
        self.user_timers
            .sort_by(|a, b| a.expiry_time.cmp(&b.expiry_time).then(a.started_id.cmp(&b.started_id)));
        self.user_timers_loaded = true;
    }

    /// Track a newly started user timer. Pure bookkeeping; emits nothing.
    pub fn add_user_timer(&mut self, timer: &TimerInfo, state: &MutableState) {
        self.load_user_timers(state);
        self.user_timers.retain(|t| t.timer_id != timer.timer_id);
        let position = self.user_timers.partition_point(|t| {
            (t.expiry_time, t.started_id) <= (timer.expiry_time, timer.started_id)
        });
        self.user_timers.insert(position, timer.clone());
    }

    /// Emit a task for the nearest user timer unless one already covers it.
    ///
    /// A timer sharing the nearest expiry that already has a task counts as
    /// covering it; that task fires every timer due at its visibility time.
    pub fn get_user_timer_task_if_needed(&mut self, state: &mut MutableState) -> Option<TimerTask> {
        self.load_user_timers(state);
        self.user_timers
            .retain(|t| state.get_user_timer(&t.timer_id).is_some());

        let nearest = self.user_timers.first()?.clone();
        let covered = state
            .pending_user_timers()
            .any(|t| t.task_created && t.expiry_time <= nearest.expiry_time);
        if covered {
            return None;
        }

        state.mark_user_timer_task_created(&nearest.timer_id);
        if let Some(tracked) = self.user_timers.first_mut() {
            tracked.task_created = true;
        }
        let task = TimerTask::new(
            self.execution.clone(),
            TimeoutType::UserTimer,
            nearest.expiry_time,
            nearest.started_id,
        )
        .with_timer(nearest.timer_id);
        Some(self.emit(task))
    }

    /// Emit a task for the nearest activity deadline unless one already covers it.
    pub fn get_activity_timer_task_if_needed(
        &mut self,
        state: &mut MutableState,
    ) -> Option<TimerTask> {
        let nearest = nearest_activity_deadline(state)?;
        if nearest.covered {
            return None;
        }
        state.mark_activity_timer_task_created(nearest.schedule_id, nearest.timeout_type);
        let task = TimerTask::new(
            self.execution.clone(),
            nearest.timeout_type,
            nearest.deadline,
            nearest.schedule_id,
        )
        .with_activity(nearest.activity_id)
        .with_attempt(nearest.attempt);
        Some(self.emit(task))
    }

    /// Emit a StartToClose task for `activity`, anchored at its start.
    ///
    /// # Errors
    ///
    /// Returns `HistoryError::Configuration` if the timeout is not positive.
    pub fn add_start_to_close_activity_timeout(
        &mut self,
        activity: &ActivityInfo,
    ) -> HistoryResult<TimerTask> {
        let anchor = activity.started_time.unwrap_or_else(|| self.clock.now());
        self.activity_timeout_task(
            activity,
            TimeoutType::ActivityStartToClose,
            anchor,
            activity.start_to_close_timeout_secs,
        )
    }

    /// Emit a ScheduleToClose task for `activity`, anchored at its scheduling.
    ///
    /// # Errors
    ///
    /// Returns `HistoryError::Configuration` if the timeout is not positive.
    pub fn add_schedule_to_close_activity_timeout(
        &mut self,
        activity: &ActivityInfo,
    ) -> HistoryResult<TimerTask> {
        self.activity_timeout_task(
            activity,
            TimeoutType::ActivityScheduleToClose,
            activity.scheduled_time,
            activity.schedule_to_close_timeout_secs,
        )
    }

    /// Emit a ScheduleToStart task for `activity`, anchored at its scheduling.
    ///
    /// # Errors
    ///
    /// Returns `HistoryError::Configuration` if the timeout is not positive.
    pub fn add_schedule_to_start_activity_timeout(
        &mut self,
        activity: &ActivityInfo,
    ) -> HistoryResult<TimerTask> {
        self.activity_timeout_task(
            activity,
            TimeoutType::ActivityScheduleToStart,
            activity.scheduled_time,
            activity.schedule_to_start_timeout_secs,
        )
    }

    fn activity_timeout_task(
        &mut self,
        activity: &ActivityInfo,
        timeout_type: TimeoutType,
        anchor: DateTime<Utc>,
        timeout_secs: i32,
    ) -> HistoryResult<TimerTask> {
        if timeout_secs <= 0 {
            return Err(HistoryError::configuration(format!(
                "activity '{}' has non-positive {timeout_type} timeout {timeout_secs}",
                activity.activity_id
            )));
        }
        let visibility = deadline_after(anchor, i64::from(timeout_secs)).ok_or_else(|| {
            HistoryError::configuration(format!(
                "activity '{}' {timeout_type} timeout {timeout_secs} is out of range",
                activity.activity_id
            ))
        })?;
        let task = TimerTask::new(
            self.execution.clone(),
            timeout_type,
            visibility,
            activity.schedule_id,
        )
        .with_activity(activity.activity_id.clone())
        .with_attempt(activity.attempt);
        Ok(self.emit(task))
    }
}
