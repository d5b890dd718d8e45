//! Counters exposed by the timer queue processor.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Live counters; cheap to bump from any worker.
#[derive(Debug, Default)]
pub struct TimerQueueMetrics {
    tasks_fired: AtomicU64,
    timeouts_applied: AtomicU64,
    stale_discarded: AtomicU64,
    conflicts: AtomicU64,
    storage_retries: AtomicU64,
    deferred: AtomicU64,
    panics: AtomicU64,
}

/// Point-in-time copy of [`TimerQueueMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Tasks this processor deleted from the queue
    pub tasks_fired: u64,
    /// Tasks whose timeout changed workflow state
    pub timeouts_applied: u64,
    /// Tasks found stale, closed or orphaned
    pub stale_discarded: u64,
    pub conflicts: u64,
    pub storage_retries: u64,
    /// Tasks set aside after a failed attempt
    pub deferred: u64,
    pub panics: u64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl TimerQueueMetrics {
    pub(crate) fn record_fired(&self) {
        bump(&self.tasks_fired, 1);
    }

    pub(crate) fn record_applied(&self, timeouts: u32) {
        bump(&self.timeouts_applied, u64::from(timeouts));
    }

    pub(crate) fn record_stale(&self) {
        bump(&self.stale_discarded, 1);
    }

    pub(crate) fn record_conflicts(&self, count: u32) {
        bump(&self.conflicts, u64::from(count));
    }

    pub(crate) fn record_storage_retries(&self, count: u32) {
        bump(&self.storage_retries, u64::from(count));
    }

    pub(crate) fn record_deferred(&self) {
        bump(&self.deferred, 1);
    }

    pub(crate) fn record_panic(&self) {
        bump(&self.panics, 1);
    }

    #[must_use]
    pub fn tasks_fired(&self) -> u64 {
        self.tasks_fired.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_fired: self.tasks_fired(),
            timeouts_applied: self.timeouts_applied.load(Ordering::Relaxed),
            stale_discarded: self.stale_discarded.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            storage_retries: self.storage_retries.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
        }
    }
}
