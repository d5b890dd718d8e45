//! In-memory projection of one workflow execution.
//!
//! A `MutableState` is owned by whoever loaded it. Every history-producing
//! operation appends one event and bumps `next_event_id`; the value of
//! `next_event_id` observed at load time is the condition for the
//! conditional update that persists the mutation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use hourglass_core::{
    EMPTY_EVENT_ID, EventAttributes, ExecutionKey, ExecutionState, FIRST_EVENT_ID, HistoryEvent,
    TimeoutType, deadline_after,
};
use serde::{Deserialize, Serialize};

use crate::error::{HistoryError, HistoryResult};

/// A pending user timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerInfo {
    /// Caller-chosen timer identifier
    pub timer_id: String,
    /// ID of the TimerStarted event
    pub started_id: i64,
    /// When the timer fires
    pub expiry_time: DateTime<Utc>,
    /// Whether a persisted timer task already covers this expiry
    pub task_created: bool,
}

/// A pending activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityInfo {
    /// ID of the ActivityTaskScheduled event
    pub schedule_id: i64,
    /// Caller-chosen activity identifier
    pub activity_id: String,
    /// When the activity was scheduled
    pub scheduled_time: DateTime<Utc>,
    /// ID of the ActivityTaskStarted event, or `EMPTY_EVENT_ID`
    pub started_id: i64,
    /// When a worker picked the activity up
    pub started_time: Option<DateTime<Utc>>,
    /// Last recorded heartbeat
    pub last_heartbeat_time: Option<DateTime<Utc>>,
    pub schedule_to_start_timeout_secs: i32,
    pub schedule_to_close_timeout_secs: i32,
    pub start_to_close_timeout_secs: i32,
    pub heartbeat_timeout_secs: i32,
    /// Retry attempt
    pub attempt: i64,
    /// Timeout classes already covered by a persisted task
    pub timer_task_status: u8,
}

impl ActivityInfo {
    /// Whether a worker has started the activity.
    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.started_id != EMPTY_EVENT_ID
    }

    /// Whether a persisted task already covers `timeout_type`.
    #[must_use]
    pub const fn has_timer_task(&self, timeout_type: TimeoutType) -> bool {
        self.timer_task_status & timeout_type.status_bit() != 0
    }

    /// Record that a persisted task covers `timeout_type`.
    pub fn mark_timer_task(&mut self, timeout_type: TimeoutType) {
        self.timer_task_status |= timeout_type.status_bit();
    }

    /// Record that the task covering `timeout_type` was consumed.
    pub fn clear_timer_task(&mut self, timeout_type: TimeoutType) {
        self.timer_task_status &= !timeout_type.status_bit();
    }

    /// Current deadline for `timeout_type`, if it applies in the activity's state.
    ///
    /// ScheduleToStart only applies before start; StartToClose and Heartbeat
    /// only after. Non-positive durations never produce a deadline.
    #[must_use]
    pub fn deadline(&self, timeout_type: TimeoutType) -> Option<DateTime<Utc>> {
        let after = |anchor: DateTime<Utc>, secs: i32| {
            if secs > 0 {
                deadline_after(anchor, i64::from(secs))
            } else {
                None
            }
        };
        match timeout_type {
            TimeoutType::ActivityScheduleToStart if !self.is_started() => {
                after(self.scheduled_time, self.schedule_to_start_timeout_secs)
            }
            TimeoutType::ActivityScheduleToClose => {
                after(self.scheduled_time, self.schedule_to_close_timeout_secs)
            }
            TimeoutType::ActivityStartToClose => self
                .started_time
                .and_then(|started| after(started, self.start_to_close_timeout_secs)),
            TimeoutType::ActivityHeartbeat => self.started_time.and_then(|started| {
                let anchor = self.last_heartbeat_time.map_or(started, |hb| hb.max(started));
                after(anchor, self.heartbeat_timeout_secs)
            }),
            _ => None,
        }
    }

    /// Every applicable deadline, earliest first, exact ties broken by class priority.
    #[must_use]
    pub fn pending_deadlines(&self) -> Vec<(DateTime<Utc>, TimeoutType)> {
        let mut deadlines: Vec<(DateTime<Utc>, TimeoutType)> =
            hourglass_core::ACTIVITY_TIMEOUT_PRIORITY
                .iter()
                .filter_map(|t| self.deadline(*t).map(|d| (d, *t)))
                .collect();
        deadlines.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.tie_break_rank().cmp(&b.1.tie_break_rank())));
        deadlines
    }
}

/// The outstanding decision task, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionInfo {
    pub schedule_id: i64,
    /// `EMPTY_EVENT_ID` until a worker starts the decision
    pub started_id: i64,
    pub attempt: i64,
    pub timeout_secs: i32,
}

impl DecisionInfo {
    /// Whether a worker has started the decision.
    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.started_id != EMPTY_EVENT_ID
    }
}

/// Execution-level fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub key: ExecutionKey,
    pub workflow_type: String,
    pub task_list: String,
    pub state: ExecutionState,
    pub next_event_id: i64,
    pub execution_timeout_secs: i32,
    pub decision_timeout_secs: i32,
    pub start_time: Option<DateTime<Utc>>,
    pub decision: Option<DecisionInfo>,
}

/// Attributes of a StartTimer decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartTimerAttributes {
    pub timer_id: String,
    pub start_to_fire_timeout_secs: i64,
}

impl StartTimerAttributes {
    #[must_use]
    pub fn new(timer_id: impl Into<String>, start_to_fire_timeout_secs: i64) -> Self {
        Self {
            timer_id: timer_id.into(),
            start_to_fire_timeout_secs,
        }
    }

    /// Reject a non-positive fire timeout.
    ///
    /// # Errors
    ///
    /// Returns `HistoryError::Configuration` if the timeout is not positive.
    pub fn validate(&self) -> HistoryResult<()> {
        if self.start_to_fire_timeout_secs <= 0 {
            return Err(HistoryError::configuration(format!(
                "timer '{}' has non-positive start-to-fire timeout {}",
                self.timer_id, self.start_to_fire_timeout_secs
            )));
        }
        Ok(())
    }
}

/// Attributes of a ScheduleActivityTask decision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleActivityAttributes {
    pub activity_id: String,
    pub schedule_to_start_timeout_secs: i32,
    pub schedule_to_close_timeout_secs: i32,
    pub start_to_close_timeout_secs: i32,
    pub heartbeat_timeout_secs: i32,
}

impl ScheduleActivityAttributes {
    #[must_use]
    pub fn new(activity_id: impl Into<String>) -> Self {
        Self {
            activity_id: activity_id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn schedule_to_start(mut self, secs: i32) -> Self {
        self.schedule_to_start_timeout_secs = secs;
        self
    }

    #[must_use]
    pub const fn schedule_to_close(mut self, secs: i32) -> Self {
        self.schedule_to_close_timeout_secs = secs;
        self
    }

    #[must_use]
    pub const fn start_to_close(mut self, secs: i32) -> Self {
        self.start_to_close_timeout_secs = secs;
        self
    }

    #[must_use]
    pub const fn heartbeat(mut self, secs: i32) -> Self {
        self.heartbeat_timeout_secs = secs;
        self
    }

    /// Fill in derivable timeouts the way decision validation does.
    ///
    /// With ScheduleToClose set, missing ScheduleToStart and StartToClose
    /// default to it. Without it, ScheduleToStart and StartToClose must both
    /// be set and ScheduleToClose becomes their sum.
    ///
    /// # Errors
    ///
    /// Returns `HistoryError::Configuration` when the timeouts cannot be completed.
    pub fn validated(mut self) -> HistoryResult<Self> {
        if self.activity_id.is_empty() {
            return Err(HistoryError::configuration("activity id is not set"));
        }
        if self.schedule_to_close_timeout_secs > 0 {
            if self.schedule_to_start_timeout_secs <= 0 {
                self.schedule_to_start_timeout_secs = self.schedule_to_close_timeout_secs;
            }
            if self.start_to_close_timeout_secs <= 0 {
                self.start_to_close_timeout_secs = self.schedule_to_close_timeout_secs;
            }
        } else if self.schedule_to_start_timeout_secs > 0 && self.start_to_close_timeout_secs > 0 {
            self.schedule_to_close_timeout_secs = self
                .schedule_to_start_timeout_secs
                .saturating_add(self.start_to_close_timeout_secs);
        } else {
            return Err(HistoryError::configuration(format!(
                "activity '{}' has an invalid timeout combination",
                self.activity_id
            )));
        }
        Ok(self)
    }
}

/// Projection of a single workflow execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutableState {
    pub execution_info: ExecutionInfo,
    pending_timers: BTreeMap<String, TimerInfo>,
    pending_activities: BTreeMap<i64, ActivityInfo>,
    history: Vec<HistoryEvent>,
}

impl MutableState {
    /// Create the state of a not-yet-started execution.
    #[must_use]
    pub fn new(key: ExecutionKey, workflow_type: impl Into<String>, task_list: impl Into<String>) -> Self {
        Self {
            execution_info: ExecutionInfo {
                key,
                workflow_type: workflow_type.into(),
                task_list: task_list.into(),
                state: ExecutionState::Created,
                next_event_id: FIRST_EVENT_ID,
                execution_timeout_secs: 0,
                decision_timeout_secs: 0,
                start_time: None,
                decision: None,
            },
            pending_timers: BTreeMap::new(),
            pending_activities: BTreeMap::new(),
            history: Vec::new(),
        }
    }

    #[must_use]
    pub const fn key(&self) -> &ExecutionKey {
        &self.execution_info.key
    }

    #[must_use]
    pub const fn next_event_id(&self) -> i64 {
        self.execution_info.next_event_id
    }

    /// Whether the execution still accepts history mutation.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        !self.execution_info.state.is_terminal()
    }

    #[must_use]
    pub fn history(&self) -> &[HistoryEvent] {
        &self.history
    }

    #[must_use]
    pub const fn pending_decision(&self) -> Option<&DecisionInfo> {
        self.execution_info.decision.as_ref()
    }

    /// Look up a pending user timer.
    #[must_use]
    pub fn get_user_timer(&self, timer_id: &str) -> Option<&TimerInfo> {
        self.pending_timers.get(timer_id)
    }

    /// Look up a pending activity by schedule ID.
    #[must_use]
    pub fn get_activity_info(&self, schedule_id: i64) -> Option<&ActivityInfo> {
        self.pending_activities.get(&schedule_id)
    }

    pub fn pending_user_timers(&self) -> impl Iterator<Item = &TimerInfo> {
        self.pending_timers.values()
    }

    pub fn pending_activities(&self) -> impl Iterator<Item = &ActivityInfo> {
        self.pending_activities.values()
    }

    /// Mark the timer as covered by a persisted task.
    pub fn mark_user_timer_task_created(&mut self, timer_id: &str) {
        if let Some(timer) = self.pending_timers.get_mut(timer_id) {
            timer.task_created = true;
        }
    }

    /// Mark the activity timeout class as covered by a persisted task.
    pub fn mark_activity_timer_task_created(&mut self, schedule_id: i64, timeout_type: TimeoutType) {
        if let Some(activity) = self.pending_activities.get_mut(&schedule_id) {
            activity.mark_timer_task(timeout_type);
        }
    }

    /// Forget that a task covers the activity timeout class.
    pub fn clear_activity_timer_task(&mut self, schedule_id: i64, timeout_type: TimeoutType) {
        if let Some(activity) = self.pending_activities.get_mut(&schedule_id) {
            activity.clear_timer_task(timeout_type);
        }
    }

    fn ensure_running(&self) -> HistoryResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(HistoryError::workflow_terminal(self.key()))
        }
    }

    fn append(&mut self, now: DateTime<Utc>, attributes: EventAttributes) -> i64 {
        let event_id = self.execution_info.next_event_id;
        self.history.push(HistoryEvent {
            event_id,
            timestamp: now,
            attributes,
        });
        self.execution_info.next_event_id = event_id.saturating_add(1);
        event_id
    }

    /// Record the start of the execution.
    ///
    /// # Errors
    ///
    /// Returns an error if the execution was already started or a timeout is not positive.
    pub fn add_workflow_execution_started_event(
        &mut self,
        now: DateTime<Utc>,
        execution_timeout_secs: i32,
        decision_timeout_secs: i32,
    ) -> HistoryResult<i64> {
        if self.execution_info.state != ExecutionState::Created {
            return Err(HistoryError::invalid_mutation(format!(
                "execution {} already started",
                self.key()
            )));
        }
        if execution_timeout_secs <= 0 || decision_timeout_secs <= 0 {
            return Err(HistoryError::configuration(
                "workflow execution and decision timeouts must be positive",
            ));
        }
        let attributes = EventAttributes::WorkflowExecutionStarted {
            workflow_type: self.execution_info.workflow_type.clone(),
            task_list: self.execution_info.task_list.clone(),
            execution_timeout_secs,
            decision_timeout_secs,
        };
        let event_id = self.append(now, attributes);
        self.execution_info.state = ExecutionState::Running;
        self.execution_info.execution_timeout_secs = execution_timeout_secs;
        self.execution_info.decision_timeout_secs = decision_timeout_secs;
        self.execution_info.start_time = Some(now);
        Ok(event_id)
    }

    /// Schedule a new decision task.
    ///
    /// # Errors
    ///
    /// Returns an error if the execution is closed or a decision is already pending.
    pub fn add_decision_task_scheduled_event(
        &mut self,
        now: DateTime<Utc>,
        attempt: i64,
    ) -> HistoryResult<DecisionInfo> {
        self.ensure_running()?;
        if self.execution_info.decision.is_some() {
            return Err(HistoryError::invalid_mutation("a decision task is already pending"));
        }
        let timeout_secs = self.execution_info.decision_timeout_secs;
        let schedule_id = self.append(
            now,
            EventAttributes::DecisionTaskScheduled {
                task_list: self.execution_info.task_list.clone(),
                timeout_secs,
                attempt,
            },
        );
        let decision = DecisionInfo {
            schedule_id,
            started_id: EMPTY_EVENT_ID,
            attempt,
            timeout_secs,
        };
        self.execution_info.decision = Some(decision.clone());
        Ok(decision)
    }

    /// Record that a worker started the pending decision.
    ///
    /// # Errors
    ///
    /// Returns an error if no matching unstarted decision is pending.
    pub fn add_decision_task_started_event(
        &mut self,
        now: DateTime<Utc>,
        schedule_id: i64,
        identity: &str,
    ) -> HistoryResult<DecisionInfo> {
        self.ensure_running()?;
        match &self.execution_info.decision {
            Some(d) if d.schedule_id == schedule_id && !d.is_started() => {}
            _ => {
                return Err(HistoryError::invalid_mutation(format!(
                    "no unstarted decision with schedule id {schedule_id}"
                )));
            }
        }
        let started_id = self.append(
            now,
            EventAttributes::DecisionTaskStarted {
                scheduled_id: schedule_id,
                identity: identity.to_string(),
            },
        );
        let decision = self
            .execution_info
            .decision
            .as_mut()
            .map(|d| {
                d.started_id = started_id;
                d.clone()
            })
            .ok_or_else(|| HistoryError::invalid_mutation("decision disappeared"))?;
        Ok(decision)
    }

    /// Complete the started decision. Returns the completed event ID.
    ///
    /// # Errors
    ///
    /// Returns an error if no matching started decision is pending.
    pub fn add_decision_task_completed_event(
        &mut self,
        now: DateTime<Utc>,
        schedule_id: i64,
        identity: &str,
    ) -> HistoryResult<i64> {
        self.ensure_running()?;
        let started_id = match &self.execution_info.decision {
            Some(d) if d.schedule_id == schedule_id && d.is_started() => d.started_id,
            _ => {
                return Err(HistoryError::invalid_mutation(format!(
                    "no started decision with schedule id {schedule_id}"
                )));
            }
        };
        let event_id = self.append(
            now,
            EventAttributes::DecisionTaskCompleted {
                scheduled_id: schedule_id,
                started_id,
                identity: identity.to_string(),
            },
        );
        self.execution_info.decision = None;
        Ok(event_id)
    }

    /// Time out the pending decision.
    ///
    /// # Errors
    ///
    /// Returns an error if the execution is closed or no decision is pending.
    pub fn add_decision_task_timed_out_event(&mut self, now: DateTime<Utc>) -> HistoryResult<DecisionInfo> {
        self.ensure_running()?;
        let decision = self
            .execution_info
            .decision
            .take()
            .ok_or_else(|| HistoryError::invalid_mutation("no decision to time out"))?;
        self.append(
            now,
            EventAttributes::DecisionTaskTimedOut {
                scheduled_id: decision.schedule_id,
                started_id: decision.started_id,
                timeout_type: TimeoutType::DecisionTimeout,
            },
        );
        Ok(decision)
    }

    /// Start a user timer.
    ///
    /// # Errors
    ///
    /// Returns an error if the attributes are invalid or the timer ID is in use.
    pub fn add_timer_started_event(
        &mut self,
        now: DateTime<Utc>,
        decision_completed_id: i64,
        attributes: &StartTimerAttributes,
    ) -> HistoryResult<TimerInfo> {
        self.ensure_running()?;
        attributes.validate()?;
        if self.pending_timers.contains_key(&attributes.timer_id) {
            return Err(HistoryError::invalid_mutation(format!(
                "timer '{}' is already started",
                attributes.timer_id
            )));
        }
        let expiry_time = deadline_after(now, attributes.start_to_fire_timeout_secs).ok_or_else(|| {
            HistoryError::configuration(format!(
                "timer '{}' start-to-fire timeout {} is out of range",
                attributes.timer_id, attributes.start_to_fire_timeout_secs
            ))
        })?;
        let started_id = self.append(
            now,
            EventAttributes::TimerStarted {
                timer_id: attributes.timer_id.clone(),
                start_to_fire_timeout_secs: attributes.start_to_fire_timeout_secs,
                decision_completed_id,
            },
        );
        let info = TimerInfo {
            timer_id: attributes.timer_id.clone(),
            started_id,
            expiry_time,
            task_created: false,
        };
        self.pending_timers.insert(info.timer_id.clone(), info.clone());
        Ok(info)
    }

    /// Fire a pending user timer.
    ///
    /// # Errors
    ///
    /// Returns an error if the timer is not pending.
    pub fn add_timer_fired_event(&mut self, now: DateTime<Utc>, timer_id: &str) -> HistoryResult<i64> {
        self.ensure_running()?;
        let info = self
            .pending_timers
            .remove(timer_id)
            .ok_or_else(|| HistoryError::invalid_mutation(format!("timer '{timer_id}' is not pending")))?;
        Ok(self.append(
            now,
            EventAttributes::TimerFired {
                timer_id: info.timer_id,
                started_id: info.started_id,
            },
        ))
    }

    /// Cancel a pending user timer.
    ///
    /// # Errors
    ///
    /// Returns an error if the timer is not pending.
    pub fn add_timer_canceled_event(&mut self, now: DateTime<Utc>, timer_id: &str) -> HistoryResult<i64> {
        self.ensure_running()?;
        let info = self
            .pending_timers
            .remove(timer_id)
            .ok_or_else(|| HistoryError::invalid_mutation(format!("timer '{timer_id}' is not pending")))?;
        Ok(self.append(
            now,
            EventAttributes::TimerCanceled {
                timer_id: info.timer_id,
                started_id: info.started_id,
            },
        ))
    }

    /// Schedule an activity. Attributes are taken as given; callers validating
    /// a decision should run [`ScheduleActivityAttributes::validated`] first.
    ///
    /// # Errors
    ///
    /// Returns an error if the execution is closed or the activity ID is in use.
    pub fn add_activity_task_scheduled_event(
        &mut self,
        now: DateTime<Utc>,
        decision_completed_id: i64,
        attributes: &ScheduleActivityAttributes,
    ) -> HistoryResult<ActivityInfo> {
        self.ensure_running()?;
        if self
            .pending_activities
            .values()
            .any(|a| a.activity_id == attributes.activity_id)
        {
            return Err(HistoryError::invalid_mutation(format!(
                "activity '{}' is already scheduled",
                attributes.activity_id
            )));
        }
        let schedule_id = self.append(
            now,
            EventAttributes::ActivityTaskScheduled {
                activity_id: attributes.activity_id.clone(),
                schedule_to_start_timeout_secs: attributes.schedule_to_start_timeout_secs,
                schedule_to_close_timeout_secs: attributes.schedule_to_close_timeout_secs,
                start_to_close_timeout_secs: attributes.start_to_close_timeout_secs,
                heartbeat_timeout_secs: attributes.heartbeat_timeout_secs,
                decision_completed_id,
            },
        );
        let info = ActivityInfo {
            schedule_id,
            activity_id: attributes.activity_id.clone(),
            scheduled_time: now,
            started_id: EMPTY_EVENT_ID,
            started_time: None,
            last_heartbeat_time: None,
            schedule_to_start_timeout_secs: attributes.schedule_to_start_timeout_secs,
            schedule_to_close_timeout_secs: attributes.schedule_to_close_timeout_secs,
            start_to_close_timeout_secs: attributes.start_to_close_timeout_secs,
            heartbeat_timeout_secs: attributes.heartbeat_timeout_secs,
            attempt: 0,
            timer_task_status: 0,
        };
        self.pending_activities.insert(schedule_id, info.clone());
        Ok(info)
    }

    /// Record that a worker started the activity.
    ///
    /// # Errors
    ///
    /// Returns an error if the activity is not pending or already started.
    pub fn add_activity_task_started_event(
        &mut self,
        now: DateTime<Utc>,
        schedule_id: i64,
        request_id: &str,
    ) -> HistoryResult<ActivityInfo> {
        self.ensure_running()?;
        match self.pending_activities.get(&schedule_id) {
            Some(a) if !a.is_started() => {}
            _ => {
                return Err(HistoryError::invalid_mutation(format!(
                    "no unstarted activity with schedule id {schedule_id}"
                )));
            }
        }
        let started_id = self.append(
            now,
            EventAttributes::ActivityTaskStarted {
                scheduled_id: schedule_id,
                request_id: request_id.to_string(),
            },
        );
        self.pending_activities
            .get_mut(&schedule_id)
            .map(|a| {
                a.started_id = started_id;
                a.started_time = Some(now);
                a.clone()
            })
            .ok_or_else(|| HistoryError::invalid_mutation("activity disappeared"))
    }

    /// Record a heartbeat; appends no event.
    ///
    /// # Errors
    ///
    /// Returns an error if the activity is not pending and started.
    pub fn record_activity_heartbeat(&mut self, now: DateTime<Utc>, schedule_id: i64) -> HistoryResult<()> {
        self.ensure_running()?;
        match self.pending_activities.get_mut(&schedule_id) {
            Some(a) if a.is_started() => {
                a.last_heartbeat_time = Some(now);
                Ok(())
            }
            _ => Err(HistoryError::invalid_mutation(format!(
                "no started activity with schedule id {schedule_id}"
            ))),
        }
    }

    /// Complete a started activity.
    ///
    /// # Errors
    ///
    /// Returns an error if the activity is not pending and started.
    pub fn add_activity_task_completed_event(
        &mut self,
        now: DateTime<Utc>,
        schedule_id: i64,
        identity: &str,
    ) -> HistoryResult<i64> {
        self.ensure_running()?;
        let started_id = match self.pending_activities.get(&schedule_id) {
            Some(a) if a.is_started() => a.started_id,
            _ => {
                return Err(HistoryError::invalid_mutation(format!(
                    "no started activity with schedule id {schedule_id}"
                )));
            }
        };
        self.pending_activities.remove(&schedule_id);
        Ok(self.append(
            now,
            EventAttributes::ActivityTaskCompleted {
                scheduled_id: schedule_id,
                started_id,
                identity: identity.to_string(),
            },
        ))
    }

    /// Time out a pending activity.
    ///
    /// # Errors
    ///
    /// Returns an error if the activity is not pending.
    pub fn add_activity_task_timed_out_event(
        &mut self,
        now: DateTime<Utc>,
        schedule_id: i64,
        timeout_type: TimeoutType,
    ) -> HistoryResult<i64> {
        self.ensure_running()?;
        let info = self.pending_activities.remove(&schedule_id).ok_or_else(|| {
            HistoryError::invalid_mutation(format!("activity {schedule_id} is not pending"))
        })?;
        Ok(self.append(
            now,
            EventAttributes::ActivityTaskTimedOut {
                scheduled_id: schedule_id,
                started_id: info.started_id,
                timeout_type,
            },
        ))
    }

    /// Complete the execution; no further history is accepted afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the execution is already closed.
    pub fn add_workflow_execution_completed_event(
        &mut self,
        now: DateTime<Utc>,
        decision_completed_id: i64,
    ) -> HistoryResult<i64> {
        self.ensure_running()?;
        let event_id = self.append(
            now,
            EventAttributes::WorkflowExecutionCompleted {
                decision_completed_id,
            },
        );
        self.execution_info.state = ExecutionState::Completed;
        self.execution_info.decision = None;
        Ok(event_id)
    }

    /// Force the execution into a closed state without recording history.
    pub fn close_as(&mut self, state: ExecutionState) {
        self.execution_info.state = state;
    }
}
