//! End-to-end behavior of the timer queue processor against the in-memory store.
//!
//! Every scenario persists timer tasks through the engine, starts a
//! processor, and waits on its fired count. Timeouts are one second, so
//! each test runs against real time.

#![allow(clippy::unwrap_used, clippy::arithmetic_side_effects, clippy::indexing_slicing)]

mod common;

use std::time::Duration;

use chrono::Utc;
use common::{TestResult, fast_config, harness, harness_with, wait_for_fired};
use hourglass_core::{EventAttributes, TimeoutType, TimerTask};
use hourglass_history::persistence::TimerTaskStore;
use hourglass_history::{
    InMemoryShardStore, ProcessorState, ScheduleActivityAttributes, StartTimerAttributes,
};

const WAIT: Duration = Duration::from_secs(10);

fn fired_timer_ids(history: &[hourglass_core::HistoryEvent]) -> Vec<String> {
    history
        .iter()
        .filter_map(|event| match &event.attributes {
            EventAttributes::TimerFired { timer_id, .. } => Some(timer_id.clone()),
            _ => None,
        })
        .collect()
}

fn activity_timeouts(history: &[hourglass_core::HistoryEvent]) -> Vec<TimeoutType> {
    history
        .iter()
        .filter_map(|event| match &event.attributes {
            EventAttributes::ActivityTaskTimedOut { timeout_type, .. } => Some(*timeout_type),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn given_single_user_timer_when_due_then_fires_and_schedules_decision() -> TestResult {
    // Given: a workflow with one 1s user timer
    let h = harness();
    let tasks = h.create_execution_with_timers(&[("tid1", 1)]).await?;
    assert_eq!(tasks.len(), 1);

    // When: the processor runs past the deadline
    h.processor.start();
    let fired = wait_for_fired(&h.processor, 1, WAIT).await;
    h.processor.stop().await;

    // Then: the timer fired once and a decision is pending
    assert!(fired, "timer task was not processed");
    let state = h.state().await?;
    assert_eq!(fired_timer_ids(state.history()), vec!["tid1".to_string()]);
    assert_eq!(state.pending_user_timers().count(), 0);
    assert!(state.pending_decision().is_some());
    assert_eq!(h.store.timer_task_count(), 0);
    assert_eq!(h.processor.metrics().timeouts_applied, 1);
    Ok(())
}

#[tokio::test]
async fn given_many_user_timers_when_processing_then_each_fires_in_deadline_order() -> TestResult {
    // Given: three timers added in one mutation; only the nearest gets a task
    let h = harness();
    let tasks = h
        .create_execution_with_timers(&[("tid1", 1), ("tid2", 2), ("tid3", 3)])
        .await?;
    assert_eq!(tasks.len(), 1);

    // When
    h.processor.start();
    let fired = wait_for_fired(&h.processor, 3, WAIT).await;
    h.processor.stop().await;

    // Then: each fired task armed the next timer
    assert!(fired);
    let state = h.state().await?;
    assert_eq!(
        fired_timer_ids(state.history()),
        vec!["tid1".to_string(), "tid2".to_string(), "tid3".to_string()]
    );
    assert_eq!(h.processor.fired_count(), 3);
    assert_eq!(h.store.timer_task_count(), 0);
    Ok(())
}

#[tokio::test]
async fn given_timers_sharing_an_expiry_when_due_then_one_task_fires_both() -> TestResult {
    // Given: two 1s timers started one second in the past
    let h = harness();
    h.start_workflow().await?;
    let completed_id = h.complete_first_decision().await?;
    let started_at = Utc::now() - chrono::Duration::seconds(1);
    let mutation = h
        .engine
        .update_workflow(&h.key, |state, builder| {
            for timer_id in ["tid1", "tid2"] {
                let timer = state.add_timer_started_event(
                    started_at,
                    completed_id,
                    &StartTimerAttributes::new(timer_id, 1),
                )?;
                builder.add_user_timer(&timer, state);
            }
            builder.get_user_timer_task_if_needed(state);
            Ok(())
        })
        .await?;
    assert_eq!(mutation.timer_tasks.len(), 1);

    // When
    h.processor.start();
    let fired = wait_for_fired(&h.processor, 1, WAIT).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    h.processor.stop().await;

    // Then: both timers fired from the single task
    assert!(fired);
    assert_eq!(h.processor.fired_count(), 1);
    let state = h.state().await?;
    let mut ids = fired_timer_ids(state.history());
    ids.sort();
    assert_eq!(ids, vec!["tid1".to_string(), "tid2".to_string()]);
    assert_eq!(h.processor.metrics().timeouts_applied, 2);
    Ok(())
}

#[tokio::test]
async fn given_decision_completed_before_timeout_when_task_due_then_discarded_as_stale() -> TestResult {
    // Given
    let h = harness();
    h.start_workflow().await?;
    let tasks = h.add_decision_timer().await?;
    assert_eq!(tasks.len(), 1);
    let before = h.state().await?;

    // When
    h.processor.start();
    let fired = wait_for_fired(&h.processor, 1, WAIT).await;
    h.processor.stop().await;

    // Then: the task was deleted without touching the workflow
    assert!(fired);
    assert_eq!(h.state().await?, before);
    let metrics = h.processor.metrics();
    assert_eq!(metrics.stale_discarded, 1);
    assert_eq!(metrics.timeouts_applied, 0);
    Ok(())
}

#[tokio::test]
async fn given_started_decision_when_timeout_elapses_then_rescheduled_with_next_attempt() -> TestResult {
    // Given: a decision with a 1s timeout, started by a worker
    let h = harness();
    h.engine
        .start_workflow(h.key.clone(), "test-workflow", "test-task-list", 100, 1)
        .await?;
    let schedule_id = h
        .state()
        .await?
        .pending_decision()
        .map(|d| d.schedule_id)
        .ok_or("no pending decision")?;
    let started = h.engine.start_decision(&h.key, schedule_id, "worker").await?;
    assert_eq!(started.timer_tasks.len(), 1);
    assert_eq!(started.timer_tasks[0].timeout_type, TimeoutType::DecisionTimeout);

    // When
    h.processor.start();
    let fired = wait_for_fired(&h.processor, 1, WAIT).await;
    h.processor.stop().await;

    // Then
    assert!(fired);
    let state = h.state().await?;
    let decision = state.pending_decision().ok_or("decision not rescheduled")?;
    assert_eq!(decision.attempt, 1);
    assert!(!decision.is_started());
    assert!(state.history().iter().any(|event| matches!(
        event.attributes,
        EventAttributes::DecisionTaskTimedOut { .. }
    )));
    Ok(())
}

#[tokio::test]
async fn given_started_activity_without_heartbeat_when_timeout_elapses_then_times_out() -> TestResult {
    // Given
    let h = harness();
    h.create_execution_with_timers(&[]).await?;
    let tasks = h.add_heartbeat_timer("activity", 1).await?;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].timeout_type, TimeoutType::ActivityHeartbeat);

    // When
    h.processor.start();
    let fired = wait_for_fired(&h.processor, 1, WAIT).await;
    h.processor.stop().await;

    // Then
    assert!(fired);
    let state = h.state().await?;
    assert_eq!(state.pending_activities().count(), 0);
    assert_eq!(activity_timeouts(state.history()), vec![TimeoutType::ActivityHeartbeat]);
    assert!(state.pending_decision().is_some());
    Ok(())
}

#[tokio::test]
async fn given_closed_workflow_when_tasks_due_then_deleted_without_mutation() -> TestResult {
    // Given: decision, user and heartbeat tasks on a workflow that then closes
    let h = harness();
    h.start_workflow().await?;
    h.add_decision_timer().await?;
    h.add_user_timer("tid1", 1).await?;
    h.add_heartbeat_timer("activity", 1).await?;
    h.close_workflow().await?;
    assert_eq!(h.store.timer_task_count(), 3);
    let next_event_id = h.state().await?.next_event_id();

    // When
    h.processor.start();
    let fired = wait_for_fired(&h.processor, 3, WAIT).await;
    h.processor.stop().await;

    // Then
    assert!(fired);
    assert_eq!(h.processor.fired_count(), 3);
    assert_eq!(h.state().await?.next_event_id(), next_event_id);
    assert_eq!(h.store.timer_task_count(), 0);
    assert_eq!(h.processor.metrics().stale_discarded, 3);
    Ok(())
}

#[tokio::test]
async fn given_completed_activity_when_schedule_to_close_task_due_then_stale() -> TestResult {
    // Given: an activity completed in the same write that armed its ScheduleToClose task
    let h = harness();
    h.create_execution_with_timers(&[]).await?;
    let now = Utc::now();
    let mutation = h
        .engine
        .update_workflow(&h.key, |state, builder| {
            let activity = state.add_activity_task_scheduled_event(
                now,
                hourglass_core::EMPTY_EVENT_ID,
                &ScheduleActivityAttributes::new("activity")
                    .schedule_to_close(1)
                    .validated()?,
            )?;
            state.add_activity_task_started_event(now, activity.schedule_id, "request")?;
            state.add_activity_task_completed_event(now, activity.schedule_id, "worker")?;
            builder.add_schedule_to_close_activity_timeout(&activity)?;
            Ok(())
        })
        .await?;
    assert_eq!(mutation.timer_tasks.len(), 1);

    // When
    h.processor.start();
    let fired = wait_for_fired(&h.processor, 1, WAIT).await;
    h.processor.stop().await;

    // Then
    assert!(fired);
    let state = h.state().await?;
    assert_eq!(state.pending_activities().count(), 0);
    assert!(activity_timeouts(state.history()).is_empty());
    assert_eq!(h.processor.metrics().stale_discarded, 1);
    Ok(())
}

#[tokio::test]
async fn given_unstarted_activity_when_schedule_to_start_elapses_then_times_out() -> TestResult {
    // Given
    let h = harness();
    h.start_workflow().await?;
    let mutation = h
        .engine
        .schedule_activity(
            &h.key,
            hourglass_core::EMPTY_EVENT_ID,
            ScheduleActivityAttributes::new("activity")
                .schedule_to_start(1)
                .start_to_close(5),
        )
        .await?;
    assert_eq!(mutation.timer_tasks.len(), 1);
    assert_eq!(
        mutation.timer_tasks[0].timeout_type,
        TimeoutType::ActivityScheduleToStart
    );

    // When
    h.processor.start();
    let fired = wait_for_fired(&h.processor, 1, WAIT).await;
    h.processor.stop().await;

    // Then
    assert!(fired);
    let state = h.state().await?;
    assert_eq!(
        activity_timeouts(state.history()),
        vec![TimeoutType::ActivityScheduleToStart]
    );
    Ok(())
}

#[tokio::test]
async fn given_started_activity_when_start_to_close_elapses_then_times_out() -> TestResult {
    // Given: scheduled with ScheduleToStart 1s, started right away with StartToClose 1s
    let h = harness();
    h.start_workflow().await?;
    let scheduled = h
        .engine
        .schedule_activity(
            &h.key,
            hourglass_core::EMPTY_EVENT_ID,
            ScheduleActivityAttributes::new("activity")
                .schedule_to_start(1)
                .start_to_close(1),
        )
        .await?;
    let started = h
        .engine
        .record_activity_started(&h.key, scheduled.result, "request")
        .await?;
    assert_eq!(started.timer_tasks.len(), 1);
    assert_eq!(
        started.timer_tasks[0].timeout_type,
        TimeoutType::ActivityStartToClose
    );

    // When: both tasks come due
    h.processor.start();
    let fired = wait_for_fired(&h.processor, 2, WAIT).await;
    h.processor.stop().await;

    // Then: the activity timed out exactly once, on StartToClose
    assert!(fired);
    let state = h.state().await?;
    assert_eq!(
        activity_timeouts(state.history()),
        vec![TimeoutType::ActivityStartToClose]
    );
    Ok(())
}

#[tokio::test]
async fn given_activity_completed_before_deadline_when_start_to_close_due_then_suppressed() -> TestResult {
    // Given: an activity started with StartToClose 1s and completed right away
    let h = harness();
    h.start_workflow().await?;
    let scheduled = h
        .engine
        .schedule_activity(
            &h.key,
            hourglass_core::EMPTY_EVENT_ID,
            ScheduleActivityAttributes::new("activity")
                .schedule_to_start(1)
                .start_to_close(1),
        )
        .await?;
    let started = h
        .engine
        .record_activity_started(&h.key, scheduled.result, "request")
        .await?;
    assert_eq!(
        started.timer_tasks[0].timeout_type,
        TimeoutType::ActivityStartToClose
    );
    h.engine
        .complete_activity(&h.key, scheduled.result, common::IDENTITY)
        .await?;
    let after_completion = h.state().await?;

    // When: both armed deadlines pass
    h.processor.start();
    let fired = wait_for_fired(&h.processor, 2, WAIT).await;
    h.processor.stop().await;

    // Then: the tasks were discarded and nothing timed out
    assert!(fired);
    let state = h.state().await?;
    assert!(activity_timeouts(state.history()).is_empty());
    assert_eq!(state.next_event_id(), after_completion.next_event_id());
    assert_eq!(h.processor.metrics().stale_discarded, 2);
    Ok(())
}

#[tokio::test]
async fn given_never_started_activity_when_schedule_to_start_fires_then_no_longer_outstanding() -> TestResult {
    // Given: ScheduleToStart 2s and StartToClose 1s, never picked up by a worker
    let h = harness();
    h.start_workflow().await?;
    let mutation = h
        .engine
        .schedule_activity(
            &h.key,
            hourglass_core::EMPTY_EVENT_ID,
            ScheduleActivityAttributes::new("activity")
                .schedule_to_start(2)
                .start_to_close(1),
        )
        .await?;

    // Then: one task, tagged with the earliest applicable timeout
    assert_eq!(mutation.timer_tasks.len(), 1);
    assert_eq!(
        mutation.timer_tasks[0].timeout_type,
        TimeoutType::ActivityScheduleToStart
    );
    assert_eq!(h.state().await?.pending_activities().count(), 1);

    // When
    h.processor.start();
    let fired = wait_for_fired(&h.processor, 1, WAIT).await;
    h.processor.stop().await;

    // Then: the activity timed out once and left the pending set
    assert!(fired);
    let state = h.state().await?;
    assert_eq!(state.pending_activities().count(), 0);
    assert_eq!(
        activity_timeouts(state.history()),
        vec![TimeoutType::ActivityScheduleToStart]
    );
    Ok(())
}

#[tokio::test]
async fn given_idle_processor_when_task_due_now_notified_then_handled_within_100ms() -> TestResult {
    // Given: a 1s poll interval and a loop that has gone idle after its first fire
    let h = harness_with(
        fast_config().with_poll_interval(Duration::from_secs(1)),
        InMemoryShardStore::new(),
    );
    let tasks = h.create_execution_with_timers(&[("tid1", 1)]).await?;
    h.processor.start();
    assert!(wait_for_fired(&h.processor, 1, WAIT).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.processor.state(), ProcessorState::Idle);

    // When: a task whose deadline is now is persisted and announced
    let mut due = tasks[0].clone();
    due.visibility_timestamp = Utc::now();
    h.store.redeliver(due.clone());
    let started = tokio::time::Instant::now();
    h.processor.notify_new_timers(&[due]);
    let fired = wait_for_fired(&h.processor, 2, WAIT).await;
    let elapsed = started.elapsed();
    h.processor.stop().await;

    // Then: handled long before the next poll
    assert!(fired);
    assert!(elapsed < Duration::from_millis(100), "took {elapsed:?}");
    Ok(())
}

#[tokio::test]
async fn given_idle_processor_when_new_timer_persisted_then_wakes_before_poll_interval() -> TestResult {
    // Given: a running processor that would otherwise sleep for 30s
    let h = harness_with(
        fast_config().with_poll_interval(Duration::from_secs(30)),
        InMemoryShardStore::new(),
    );
    h.create_execution_with_timers(&[]).await?;
    h.processor.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.processor.state(), ProcessorState::Idle);

    // When: a 1s timer is started through the engine
    let started = tokio::time::Instant::now();
    h.add_user_timer("tid1", 1).await?;
    let fired = wait_for_fired(&h.processor, 1, WAIT).await;
    let elapsed = started.elapsed();
    h.processor.stop().await;

    // Then: the notification woke the loop long before the poll interval
    assert!(fired);
    assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");
    Ok(())
}

#[tokio::test]
async fn given_processed_task_when_redelivered_then_discarded_without_second_effect() -> TestResult {
    // Given: a fired timer
    let h = harness();
    let tasks: Vec<TimerTask> = h.create_execution_with_timers(&[("tid1", 1)]).await?;
    h.processor.start();
    assert!(wait_for_fired(&h.processor, 1, WAIT).await);
    let after_first = h.state().await?;

    // When: the queue hands out the same task again
    for task in tasks {
        h.store.redeliver(task);
    }
    h.processor.notify_new_timers(&h.store.timer_tasks());
    let fired = wait_for_fired(&h.processor, 2, WAIT).await;
    h.processor.stop().await;

    // Then
    assert!(fired);
    assert_eq!(h.state().await?, after_first);
    assert_eq!(fired_timer_ids(after_first.history()).len(), 1);
    assert_eq!(h.processor.metrics().stale_discarded, 1);
    Ok(())
}

#[tokio::test]
async fn given_concurrent_writer_when_firing_then_reloads_and_applies_once() -> TestResult {
    // Given
    let h = harness();
    h.create_execution_with_timers(&[("tid1", 1)]).await?;
    h.store.conflict_next_updates(2);

    // When
    h.processor.start();
    let fired = wait_for_fired(&h.processor, 1, WAIT).await;
    h.processor.stop().await;

    // Then
    assert!(fired);
    assert_eq!(h.processor.metrics().conflicts, 2);
    assert_eq!(fired_timer_ids(h.state().await?.history()).len(), 1);
    Ok(())
}

#[tokio::test]
async fn given_conflicts_beyond_retry_limit_when_firing_then_deferred_and_retried() -> TestResult {
    // Given: a single conflict retry allowed, and three conflicts queued up
    let mut config = fast_config();
    config.max_conflict_retries = 1;
    let h = harness_with(config, InMemoryShardStore::new());
    h.create_execution_with_timers(&[("tid1", 1)]).await?;
    h.store.conflict_next_updates(3);

    // When
    h.processor.start();
    let fired = wait_for_fired(&h.processor, 1, WAIT).await;
    h.processor.stop().await;

    // Then: the first attempt gave up, the deferred retry succeeded
    assert!(fired);
    let metrics = h.processor.metrics();
    assert!(metrics.deferred >= 1);
    assert_eq!(metrics.conflicts, 3);
    assert_eq!(fired_timer_ids(h.state().await?.history()).len(), 1);
    Ok(())
}

#[tokio::test]
async fn given_transient_storage_failures_when_firing_then_retried_transparently() -> TestResult {
    // Given
    let h = harness();
    h.create_execution_with_timers(&[("tid1", 1)]).await?;
    h.store.fail_next_timer_reads(2);
    h.store.fail_next_execution_reads(1);
    h.store.fail_next_timer_deletes(1);

    // When
    h.processor.start();
    let fired = wait_for_fired(&h.processor, 1, WAIT).await;
    h.processor.stop().await;

    // Then
    assert!(fired);
    let metrics = h.processor.metrics();
    assert!(metrics.storage_retries >= 4, "{metrics:?}");
    assert_eq!(metrics.deferred, 0);
    assert_eq!(fired_timer_ids(h.state().await?.history()).len(), 1);
    Ok(())
}

#[tokio::test]
async fn given_processed_tasks_when_all_finished_then_ack_level_is_published() -> TestResult {
    // Given
    let h = harness();
    let tasks = h.create_execution_with_timers(&[("tid1", 1)]).await?;
    let first = tasks.first().ok_or("no task")?.sequence_id();

    // When
    h.processor.start();
    assert!(wait_for_fired(&h.processor, 1, WAIT).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.processor.stop().await;

    // Then
    let level = h.shard.timer_ack_level().ok_or("ack level not published")?;
    assert!(level >= first);
    assert_eq!(h.store.timer_ack_level().await?, Some(level));
    Ok(())
}

#[tokio::test]
async fn given_stopped_processor_when_timers_come_due_then_nothing_is_processed() -> TestResult {
    // Given
    let h = harness();
    h.processor.start();
    h.processor.stop().await;
    assert_eq!(h.processor.state(), ProcessorState::Stopped);

    // When
    h.create_execution_with_timers(&[("tid1", 1)]).await?;
    h.processor.start();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    // Then
    assert_eq!(h.processor.fired_count(), 0);
    assert_eq!(h.store.timer_task_count(), 1);
    Ok(())
}
