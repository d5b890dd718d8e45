//! Shard configuration.
//!
//! Loaded from TOML; every field has a default so a partial file is enough.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HistoryError, HistoryResult};
use crate::persistence::StoreConfig;
use crate::retry::RetryPolicy;

/// Configuration for one shard of the history service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Partition owned by this instance.
    #[serde(default)]
    pub shard_id: u32,

    /// Timer queue processor tuning.
    #[serde(default)]
    pub timer_queue: TimerQueueConfig,

    /// Backing store.
    #[serde(default)]
    pub store: StoreConfig,
}

/// Tuning for the timer queue processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerQueueConfig {
    /// Upper bound on how long the processor sleeps between scans.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Tasks read per page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Tasks applied concurrently.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// Reload-and-retry attempts on a conditional update conflict.
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,

    /// How long a deferred task is skipped before it is retried.
    #[serde(default = "default_deferred_task_backoff_ms")]
    pub deferred_task_backoff_ms: u64,

    /// Backoff for transient storage failures.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for TimerQueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            page_size: default_page_size(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_conflict_retries: default_max_conflict_retries(),
            deferred_task_backoff_ms: default_deferred_task_backoff_ms(),
            retry: RetryPolicy::default(),
        }
    }
}

impl TimerQueueConfig {
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub const fn deferred_task_backoff(&self) -> Duration {
        Duration::from_millis(self.deferred_task_backoff_ms)
    }

    /// Set the poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the page size.
    #[must_use]
    pub const fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the worker count.
    #[must_use]
    pub const fn with_max_concurrent_tasks(mut self, workers: usize) -> Self {
        self.max_concurrent_tasks = workers;
        self
    }

    /// Check every value is usable.
    ///
    /// # Errors
    ///
    /// Returns `HistoryError::Configuration` naming the first bad field.
    pub fn validate(&self) -> HistoryResult<()> {
        if self.poll_interval_ms == 0 {
            return Err(HistoryError::configuration("poll_interval_ms must be positive"));
        }
        if self.page_size == 0 {
            return Err(HistoryError::configuration("page_size must be positive"));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(HistoryError::configuration(
                "max_concurrent_tasks must be positive",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(HistoryError::configuration(
                "retry.max_attempts must be positive",
            ));
        }
        for (field, value) in [
            ("poll_interval_ms", self.poll_interval_ms),
            ("deferred_task_backoff_ms", self.deferred_task_backoff_ms),
            ("retry.max_backoff_ms", self.retry.max_backoff_ms),
        ] {
            if value > MAX_INTERVAL_MS {
                return Err(HistoryError::configuration(format!(
                    "{field} must be at most {MAX_INTERVAL_MS}"
                )));
            }
        }
        Ok(())
    }
}

impl HistoryConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or fails validation.
    pub fn from_toml_str(content: &str) -> HistoryResult<Self> {
        let config: Self = toml::from_str(content).map_err(hourglass_core::Error::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> HistoryResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            hourglass_core::Error::file_read_failed(path.display().to_string(), e.to_string())
        })?;
        Self::from_toml_str(&content)
    }

    /// Check every section.
    ///
    /// # Errors
    ///
    /// Returns `HistoryError::Configuration` naming the first bad field.
    pub fn validate(&self) -> HistoryResult<()> {
        self.timer_queue.validate()
    }
}

/// Longest interval any timer queue setting may express: one day.
pub const MAX_INTERVAL_MS: u64 = 86_400_000;

const fn default_poll_interval_ms() -> u64 {
    1000
}

const fn default_page_size() -> usize {
    100
}

const fn default_max_concurrent_tasks() -> usize {
    4
}

const fn default_max_conflict_retries() -> u32 {
    5
}

const fn default_deferred_task_backoff_ms() -> u64 {
    1000
}
