//! Per-partition context.
//!
//! A `ShardContext` is created once per shard and handed to the engine and
//! the processor of that shard. It allocates task IDs and carries the shard's
//! clock, configuration and published ack level.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use hourglass_core::{Clock, TimerSequenceId, TimerTask};
use parking_lot::RwLock;
use tracing::info;

use crate::config::HistoryConfig;
use crate::error::HistoryResult;
use crate::persistence::ShardStore;

/// Identity and shared bookkeeping of one shard.
#[derive(Debug)]
pub struct ShardContext {
    shard_id: u32,
    config: HistoryConfig,
    clock: Arc<dyn Clock>,
    next_task_id: AtomicI64,
    timer_ack_level: RwLock<Option<TimerSequenceId>>,
}

impl ShardContext {
    /// Create a context whose task IDs start after `max_task_id`.
    #[must_use]
    pub fn new(config: HistoryConfig, clock: Arc<dyn Clock>, max_task_id: i64) -> Self {
        Self {
            shard_id: config.shard_id,
            config,
            clock,
            next_task_id: AtomicI64::new(max_task_id.saturating_add(1)),
            timer_ack_level: RwLock::new(None),
        }
    }

    /// Open a shard against `store`, seeding the task ID allocator and ack level.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the store cannot be read.
    pub async fn open(
        config: HistoryConfig,
        clock: Arc<dyn Clock>,
        store: &dyn ShardStore,
    ) -> HistoryResult<Self> {
        config.validate()?;
        let max_task_id = store.max_task_id().await?;
        let ack_level = store.timer_ack_level().await?;
        let shard = Self::new(config, clock, max_task_id);
        *shard.timer_ack_level.write() = ack_level;
        info!(
            shard_id = shard.shard_id,
            max_task_id,
            ack_level = ?ack_level,
            "shard opened"
        );
        Ok(shard)
    }

    #[must_use]
    pub const fn shard_id(&self) -> u32 {
        self.shard_id
    }

    #[must_use]
    pub const fn config(&self) -> &HistoryConfig {
        &self.config
    }

    #[must_use]
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Assign fresh, strictly increasing task IDs to `tasks`.
    pub fn allocate_task_ids(&self, tasks: &mut [TimerTask]) {
        let count = i64::try_from(tasks.len()).unwrap_or(i64::MAX);
        let first = self.next_task_id.fetch_add(count, Ordering::SeqCst);
        for (offset, task) in (0_i64..).zip(tasks.iter_mut()) {
            task.task_id = first.saturating_add(offset);
        }
    }

    /// Record the processor's ack level.
    pub fn update_timer_ack_level(&self, level: TimerSequenceId) {
        let mut current = self.timer_ack_level.write();
        if current.is_none_or(|c| c < level) {
            *current = Some(level);
        }
    }

    #[must_use]
    pub fn timer_ack_level(&self) -> Option<TimerSequenceId> {
        *self.timer_ack_level.read()
    }
}
