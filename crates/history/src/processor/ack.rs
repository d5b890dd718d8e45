//! Ack level tracking.
//!
//! The ack level is the highest sequence ID such that every task read at or
//! below it has finished. It only moves forward.

use std::collections::BTreeMap;

use hourglass_core::TimerSequenceId;

#[derive(Debug, Default)]
pub(crate) struct TimerAckManager {
    /// Read tasks, mapped to whether they finished
    outstanding: BTreeMap<TimerSequenceId, bool>,
    ack_level: Option<TimerSequenceId>,
}

impl TimerAckManager {
    pub(crate) fn new(ack_level: Option<TimerSequenceId>) -> Self {
        Self {
            outstanding: BTreeMap::new(),
            ack_level,
        }
    }

    /// Track a task handed to a worker.
    pub(crate) fn read(&mut self, id: TimerSequenceId) {
        if self.ack_level.is_some_and(|level| id <= level) {
            return;
        }
        self.outstanding.entry(id).or_insert(false);
    }

    pub(crate) fn complete(&mut self, id: TimerSequenceId) {
        if let Some(done) = self.outstanding.get_mut(&id) {
            *done = true;
        }
    }

    /// Move past the finished prefix. Returns the new level if it moved.
    pub(crate) fn advance(&mut self) -> Option<TimerSequenceId> {
        let mut moved = None;
        while let Some(entry) = self.outstanding.first_entry() {
            if !*entry.get() {
                break;
            }
            moved = Some(*entry.key());
            entry.remove();
        }
        if let Some(level) = moved {
            self.ack_level = Some(level);
        }
        moved
    }

    pub(crate) const fn ack_level(&self) -> Option<TimerSequenceId> {
        self.ack_level
    }
}
