//! Timer queue processor.
//!
//! One processor drains the timer task queue of one shard. A single loop
//! reads due tasks in `(visibility_timestamp, task_id)` order and hands
//! them to a bounded set of workers. Each worker applies the timeout to its
//! workflow and deletes the task. Between scans the loop sleeps on a
//! [`TimerGate`] armed with the next known deadline, bounded by the poll
//! interval, and woken early by [`TimerQueueProcessor::notify_new_timers`].
//!
//! A failed task is deferred: it stays in the queue and is skipped until
//! its backoff expires. Every read is range-based from the queue head, so a
//! task is never lost because the ack level moved past it.

mod ack;
mod handlers;
mod metrics;

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use hourglass_core::{TimerTask, earliest_visibility};
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::TimerQueueConfig;
use crate::engine::{TimerNotifier, UpdateStats};
use crate::error::{HistoryError, HistoryResult};
use crate::persistence::{GetTimerTasksRequest, PersistenceError, ShardStore};
use crate::shard::ShardContext;
use crate::timer_gate::{GateEvent, TimerGate};

use ack::TimerAckManager;
use handlers::{TaskOutcome, apply_timer_task};

pub use metrics::{MetricsSnapshot, TimerQueueMetrics};

/// Lifecycle of a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessorState {
    /// Constructed, not started
    Created = 0,
    /// Waiting on the gate
    Idle = 1,
    /// Reading the queue
    Scanning = 2,
    /// Handing tasks to workers
    Dispatching = 3,
    /// Draining in-flight tasks after `stop`
    Stopping = 4,
    Stopped = 5,
}

impl ProcessorState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Idle,
            2 => Self::Scanning,
            3 => Self::Dispatching,
            4 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Drains the timer task queue of one shard.
pub struct TimerQueueProcessor {
    inner: Arc<Inner>,
    run_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TimerQueueProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerQueueProcessor")
            .field("shard_id", &self.inner.shard.shard_id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct Inner {
    shard: Arc<ShardContext>,
    store: Arc<dyn ShardStore>,
    gate: TimerGate,
    state: AtomicU8,
    metrics: TimerQueueMetrics,
}

/// Why a worker did not finish its task.
enum WorkerFailure {
    Error(HistoryError),
    Panicked,
}

struct Processed {
    outcome: TaskOutcome,
    deleted: bool,
}

struct TaskReport {
    task: TimerTask,
    stats: UpdateStats,
    result: Result<Processed, WorkerFailure>,
}

/// State owned by the processing loop.
struct RunState {
    workers: JoinSet<TaskReport>,
    in_flight: HashSet<i64>,
    deferred: HashMap<i64, Instant>,
    ack: TimerAckManager,
}

enum Wake {
    Gate(GateEvent),
    Worker(Result<TaskReport, JoinError>),
}

impl TimerQueueProcessor {
    #[must_use]
    pub fn new(shard: Arc<ShardContext>, store: Arc<dyn ShardStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                shard,
                store,
                gate: TimerGate::new(),
                state: AtomicU8::new(ProcessorState::Created as u8),
                metrics: TimerQueueMetrics::default(),
            }),
            run_handle: Mutex::new(None),
        }
    }

    /// Spawn the processing loop on the current tokio runtime.
    ///
    /// Only the first call has an effect; a stopped processor stays stopped.
    pub fn start(&self) {
        let Ok(mut run_handle) = self.run_handle.try_lock() else {
            debug!(
                shard_id = self.inner.shard.shard_id(),
                "timer queue processor lifecycle change in progress"
            );
            return;
        };
        let started = self.inner.state.compare_exchange(
            ProcessorState::Created as u8,
            ProcessorState::Idle as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if started.is_err() {
            debug!(
                shard_id = self.inner.shard.shard_id(),
                state = ?self.state(),
                "timer queue processor already started"
            );
            return;
        }
        let inner = Arc::clone(&self.inner);
        *run_handle = Some(tokio::spawn(inner.run()));
    }

    /// Stop the loop and wait for it and every in-flight task. Idempotent.
    ///
    /// The state reads `Stopping` while tasks drain and `Stopped` once the
    /// loop has exited. Concurrent callers all return after the loop exits.
    pub async fn stop(&self) {
        let mut run_handle = self.run_handle.lock().await;
        let stopping = self
            .inner
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != ProcessorState::Stopped as u8)
                    .then_some(ProcessorState::Stopping as u8)
            });
        if stopping.is_err() {
            return;
        }
        self.inner.gate.close();

        if let Some(handle) = run_handle.take() {
            if let Err(err) = handle.await {
                error!(
                    shard_id = self.inner.shard.shard_id(),
                    error = %err,
                    "timer queue processor loop did not exit cleanly"
                );
            }
        }
        self.inner
            .state
            .store(ProcessorState::Stopped as u8, Ordering::SeqCst);
    }

    /// Wake the loop if `tasks` contain a deadline earlier than any armed one.
    pub fn notify_new_timers(&self, tasks: &[TimerTask]) {
        self.inner.notify_new_timers(tasks);
    }

    #[must_use]
    pub fn state(&self) -> ProcessorState {
        ProcessorState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// Number of tasks this processor deleted from the queue.
    #[must_use]
    pub fn fired_count(&self) -> u64 {
        self.inner.metrics.tasks_fired()
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }
}

impl TimerNotifier for TimerQueueProcessor {
    fn notify_new_timers(&self, tasks: &[TimerTask]) {
        self.inner.notify_new_timers(tasks);
    }
}

/// `now + delay` on the wall clock, saturating at the far future.
fn wall_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl Inner {
    fn config(&self) -> &TimerQueueConfig {
        &self.shard.config().timer_queue
    }

    fn is_stopping(&self) -> bool {
        self.state.load(Ordering::SeqCst) >= ProcessorState::Stopping as u8
    }

    /// Record loop progress; never overrides a stop in progress.
    fn set_state(&self, next: ProcessorState) {
        let _ = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < ProcessorState::Stopping as u8).then_some(next as u8)
            });
    }

    /// Monotonic instant matching wall-clock time `at`.
    fn instant_at(&self, at: DateTime<Utc>) -> Instant {
        let delay = at
            .signed_duration_since(self.shard.clock().now())
            .to_std()
            .unwrap_or_default();
        let now = Instant::now();
        now.checked_add(delay).unwrap_or(now)
    }

    /// Arm the gate for new tasks due within one poll interval.
    ///
    /// Later tasks are left to the scan, which always re-arms within the
    /// poll interval and reads the store's earliest deadline.
    fn notify_new_timers(&self, tasks: &[TimerTask]) {
        let Some(visibility) = earliest_visibility(tasks) else {
            return;
        };
        let now = self.shard.clock().now();
        if visibility > wall_after(now, self.config().poll_interval()) {
            return;
        }
        let woke = self.gate.set_next(self.instant_at(visibility));
        debug!(
            shard_id = self.shard.shard_id(),
            count = tasks.len(),
            %visibility,
            woke,
            armed = self.gate.armed(),
            "new timer tasks"
        );
    }

    async fn run(self: Arc<Self>) {
        let shard_id = self.shard.shard_id();
        let mut run = RunState {
            workers: JoinSet::new(),
            in_flight: HashSet::new(),
            deferred: HashMap::new(),
            ack: TimerAckManager::new(self.shard.timer_ack_level()),
        };
        info!(shard_id, "timer queue processor started");

        while !self.is_stopping() {
            self.set_state(ProcessorState::Scanning);
            if let Err(err) = self.scan(&mut run).await {
                error!(shard_id, error = %err, "timer queue scan failed");
                if let Some(retry_at) = Instant::now().checked_add(self.config().poll_interval()) {
                    self.gate.set_next(retry_at);
                }
            }
            self.set_state(ProcessorState::Idle);

            let wake = tokio::select! {
                event = self.gate.wait() => Wake::Gate(event),
                Some(joined) = run.workers.join_next(), if !run.workers.is_empty() => Wake::Worker(joined),
            };
            match wake {
                Wake::Gate(GateEvent::Closed) => break,
                Wake::Gate(GateEvent::Fired) => {}
                Wake::Worker(joined) => self.on_worker_done(&mut run, joined).await,
            }
            while let Some(joined) = run.workers.try_join_next() {
                self.on_worker_done(&mut run, joined).await;
            }
        }

        while let Some(joined) = run.workers.join_next().await {
            self.on_worker_done(&mut run, joined).await;
        }
        info!(
            shard_id,
            ack_level = ?run.ack.ack_level(),
            fired = self.metrics.tasks_fired(),
            "timer queue processor stopped"
        );
    }

    /// Read due tasks from the queue head, dispatch what can run, and arm the gate.
    async fn scan(self: &Arc<Self>, run: &mut RunState) -> HistoryResult<()> {
        let config = self.config();
        let now = self.shard.clock().now();
        let poll_deadline = wall_after(now, config.poll_interval());
        let armed = self
            .gate
            .next_deadline()
            .and_then(|at| at.checked_duration_since(Instant::now()))
            .filter(|delay| !delay.is_zero())
            .map(|delay| wall_after(now, delay));
        let look_ahead = armed.map_or(poll_deadline, |at| at.min(poll_deadline));

        let mut token = None;
        let mut next_visible = None;
        let mut saturated = false;
        'pages: loop {
            let request = GetTimerTasksRequest::new(look_ahead, config.page_size).after(token);
            let page = config
                .retry
                .run(
                    "get_timer_tasks",
                    PersistenceError::is_retryable,
                    || self.metrics.record_storage_retries(1),
                    || self.store.get_timer_tasks(request.clone()),
                )
                .await?;

            for task in page.timers {
                if task.visibility_timestamp > now {
                    next_visible = Some(task.visibility_timestamp);
                    break 'pages;
                }
                if run.in_flight.contains(&task.task_id) {
                    continue;
                }
                if run
                    .deferred
                    .get(&task.task_id)
                    .is_some_and(|until| *until > Instant::now())
                {
                    continue;
                }
                if run.workers.len() >= config.max_concurrent_tasks {
                    saturated = true;
                    break 'pages;
                }
                self.set_state(ProcessorState::Dispatching);
                self.dispatch(run, task);
            }

            match page.next_page_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        // A full worker pool wakes the loop on the next completion.
        let wake_at = if saturated {
            poll_deadline
        } else if let Some(at) = next_visible {
            at
        } else {
            self.store
                .earliest_future_deadline(now)
                .await?
                .unwrap_or(poll_deadline)
        };
        self.gate.set_next(self.instant_at(wake_at.min(poll_deadline)));

        let instant_now = Instant::now();
        run.deferred.retain(|_, until| *until > instant_now);
        if let Some(until) = run.deferred.values().min() {
            self.gate.set_next(*until);
        }
        Ok(())
    }

    fn dispatch(self: &Arc<Self>, run: &mut RunState, task: TimerTask) {
        debug!(
            shard_id = self.shard.shard_id(),
            task_id = task.task_id,
            timeout_type = %task.timeout_type,
            execution = %task.execution,
            "dispatching timer task"
        );
        run.in_flight.insert(task.task_id);
        run.deferred.remove(&task.task_id);
        run.ack.read(task.sequence_id());
        run.workers.spawn(Arc::clone(self).process(task));
    }

    async fn process(self: Arc<Self>, task: TimerTask) -> TaskReport {
        let mut stats = UpdateStats::default();
        let result = AssertUnwindSafe(self.process_task(&task, &mut stats))
            .catch_unwind()
            .await
            .map_err(|_| WorkerFailure::Panicked)
            .and_then(|processed| processed.map_err(WorkerFailure::Error));
        TaskReport {
            task,
            stats,
            result,
        }
    }

    async fn process_task(
        &self,
        task: &TimerTask,
        stats: &mut UpdateStats,
    ) -> HistoryResult<Processed> {
        let applied = apply_timer_task(&self.shard, self.store.as_ref(), task, stats).await?;
        self.notify_new_timers(&applied.new_tasks);

        let deleted = self
            .config()
            .retry
            .run(
                "delete_timer_task",
                PersistenceError::is_retryable,
                || stats.storage_retries = stats.storage_retries.saturating_add(1),
                || self.store.delete_timer_task(task.task_id),
            )
            .await?;
        Ok(Processed {
            outcome: applied.outcome,
            deleted,
        })
    }

    async fn on_worker_done(&self, run: &mut RunState, joined: Result<TaskReport, JoinError>) {
        let report = match joined {
            Ok(report) => report,
            Err(err) => {
                // Workers are never aborted; the in-flight entry is dropped with the set.
                error!(
                    shard_id = self.shard.shard_id(),
                    error = %err,
                    "timer task worker vanished"
                );
                return;
            }
        };
        let TaskReport {
            task,
            stats,
            result,
        } = report;
        run.in_flight.remove(&task.task_id);
        self.metrics.record_conflicts(stats.conflicts);
        self.metrics.record_storage_retries(stats.storage_retries);

        match result {
            Ok(processed) => {
                if processed.deleted {
                    self.metrics.record_fired();
                }
                match processed.outcome {
                    TaskOutcome::Applied { timeouts } => self.metrics.record_applied(timeouts),
                    TaskOutcome::Stale | TaskOutcome::Closed | TaskOutcome::NotFound => {
                        self.metrics.record_stale();
                    }
                }
                debug!(
                    shard_id = self.shard.shard_id(),
                    task_id = task.task_id,
                    outcome = ?processed.outcome,
                    deleted = processed.deleted,
                    "timer task processed"
                );
                run.ack.complete(task.sequence_id());
                self.publish_ack_level(run).await;
            }
            Err(WorkerFailure::Error(err)) => {
                warn!(
                    shard_id = self.shard.shard_id(),
                    task_id = task.task_id,
                    error = %err,
                    "timer task failed, deferring"
                );
                self.defer(run, &task);
            }
            Err(WorkerFailure::Panicked) => {
                self.metrics.record_panic();
                error!(
                    shard_id = self.shard.shard_id(),
                    task_id = task.task_id,
                    "timer task panicked, deferring"
                );
                self.defer(run, &task);
            }
        }
    }

    fn defer(&self, run: &mut RunState, task: &TimerTask) {
        let now = Instant::now();
        let until = now
            .checked_add(self.config().deferred_task_backoff())
            .unwrap_or(now);
        run.deferred.insert(task.task_id, until);
        self.metrics.record_deferred();
        self.gate.set_next(until);
    }

    async fn publish_ack_level(&self, run: &mut RunState) {
        let Some(level) = run.ack.advance() else {
            return;
        };
        self.shard.update_timer_ack_level(level);
        if let Err(err) = self.store.update_timer_ack_level(level).await {
            warn!(
                shard_id = self.shard.shard_id(),
                ack_level = %level,
                error = %err,
                "failed to persist timer ack level"
            );
        }
    }
}
