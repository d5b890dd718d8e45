//! Wake primitive for the timer queue processor.
//!
//! The gate keeps an ordered set of armed deadlines and an async
//! notification. Waiting sleeps until the earliest deadline; arming an
//! earlier deadline wakes the waiter so it can re-sleep on the new head. A
//! later deadline never delays an earlier one that is already armed.
//!
//! At most [`MAX_ARMED_DEADLINES`] are kept. Arming past that drops the
//! latest ones; the processor re-derives them from the store on its next scan.

use std::collections::BTreeSet;
use std::pin::pin;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Why [`TimerGate::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateEvent {
    /// An armed deadline passed.
    Fired,
    /// The gate was closed.
    Closed,
}

/// Deadlines armed at once.
pub const MAX_ARMED_DEADLINES: usize = 64;

#[derive(Debug, Default)]
struct GateState {
    deadlines: BTreeSet<Instant>,
    closed: bool,
}

impl GateState {
    /// Drop every deadline at or before `now`; true if any was dropped.
    fn consume_due(&mut self, now: Instant) -> bool {
        let mut fired = false;
        while self.deadlines.first().is_some_and(|at| *at <= now) {
            self.deadlines.pop_first();
            fired = true;
        }
        fired
    }
}

/// Deadline-driven wake signal owned by one processor.
#[derive(Debug, Default)]
pub struct TimerGate {
    state: Mutex<GateState>,
    notify: Notify,
}

impl TimerGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the gate to fire at `deadline`.
    ///
    /// Returns `true` if `deadline` became the earliest armed wake time.
    pub fn set_next(&self, deadline: Instant) -> bool {
        let earlier = {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            let earlier = state
                .deadlines
                .first()
                .is_none_or(|current| deadline < *current);
            state.deadlines.insert(deadline);
            if state.deadlines.len() > MAX_ARMED_DEADLINES {
                state.deadlines.pop_last();
            }
            earlier
        };
        if earlier {
            self.notify.notify_waiters();
        }
        earlier
    }

    /// Earliest armed deadline, if any.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.state.lock().deadlines.first().copied()
    }

    /// Number of armed deadlines.
    #[must_use]
    pub fn armed(&self) -> usize {
        self.state.lock().deadlines.len()
    }

    /// Whether [`TimerGate::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Wait until the earliest deadline passes or the gate closes.
    ///
    /// Firing consumes every deadline that has passed. With nothing armed
    /// this waits for the next [`TimerGate::set_next`] or [`TimerGate::close`].
    pub async fn wait(&self) -> GateEvent {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            let next = {
                let mut state = self.state.lock();
                if state.closed {
                    return GateEvent::Closed;
                }
                if state.consume_due(Instant::now()) {
                    return GateEvent::Fired;
                }
                state.deadlines.first().copied()
            };

            match next {
                Some(at) => {
                    tokio::select! {
                        () = tokio::time::sleep_until(at) => {}
                        () = notified.as_mut() => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Close the gate and release every waiter. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.deadlines.clear();
        }
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::arithmetic_side_effects, clippy::indexing_slicing)]

    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fires_at_armed_deadline() {
        let gate = TimerGate::new();
        let start = Instant::now();
        gate.set_next(start + Duration::from_secs(2));

        assert_eq!(gate.wait().await, GateEvent::Fired);
        assert!(Instant::now() >= start + Duration::from_secs(2));
        assert!(gate.next_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_later_deadline_does_not_delay_earlier() {
        let gate = TimerGate::new();
        let start = Instant::now();
        assert!(gate.set_next(start + Duration::from_secs(1)));
        assert!(!gate.set_next(start + Duration::from_secs(5)));
        assert_eq!(gate.next_deadline(), Some(start + Duration::from_secs(1)));

        assert_eq!(gate.wait().await, GateEvent::Fired);
        assert!(Instant::now() < start + Duration::from_secs(5));
        assert_eq!(gate.next_deadline(), Some(start + Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_earlier_deadline_wakes_waiter() {
        let gate = Arc::new(TimerGate::new());
        let start = Instant::now();
        gate.set_next(start + Duration::from_secs(60));

        let waiter = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move { gate.wait().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(gate.set_next(Instant::now()));

        assert_eq!(waiter.await.unwrap(), GateEvent::Fired);
        assert!(Instant::now() < start + Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_releases_waiter_and_is_idempotent() {
        let gate = Arc::new(TimerGate::new());
        let waiter = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move { gate.wait().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        gate.close();
        gate.close();
        assert_eq!(waiter.await.unwrap(), GateEvent::Closed);
        assert!(gate.is_closed());
        assert!(!gate.set_next(Instant::now()));
        assert_eq!(gate.wait().await, GateEvent::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_armed_deadlines_stay_bounded() {
        let gate = TimerGate::new();
        let start = Instant::now();
        for i in (0..10_000_u64).rev() {
            gate.set_next(start + Duration::from_secs(60 + i));
        }
        gate.set_next(start + Duration::from_secs(60));

        assert_eq!(gate.armed(), MAX_ARMED_DEADLINES);
        assert_eq!(gate.next_deadline(), Some(start + Duration::from_secs(60)));
        assert!(!gate.set_next(start + Duration::from_secs(90_000)));
        assert_eq!(gate.armed(), MAX_ARMED_DEADLINES);
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_deadline_fires_immediately() {
        let gate = TimerGate::new();
        gate.set_next(Instant::now());
        assert_eq!(gate.wait().await, GateEvent::Fired);
    }
}
