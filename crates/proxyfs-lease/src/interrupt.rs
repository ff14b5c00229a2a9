//! Interrupt escalation state.
//!
//! Tracks one revoke/demote cycle for a coordinator: a generation counter
//! so late acknowledgments and stale timer ticks are discarded, an attempt
//! counter against the configured limit, and the retransmit timer itself.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::timer::{self, TimerHandle};

/// What a coordinator should do with an interrupt timer tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Tick belongs to a finished generation; drop it.
    Stale,
    /// Redeliver the interrupt callbacks to holders still pending.
    Retransmit,
    /// The attempt limit was reached; treat non-responders as dead.
    Expired,
}

/// Interrupt escalation state for a single coordinator.
#[derive(Debug, Default)]
pub struct InterruptState {
    generation: u64,
    attempts: u32,
    timer: Option<TimerHandle>,
}

impl InterruptState {
    /// Creates an idle interrupt state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new interrupt cycle, arming a periodic retransmit timer.
    ///
    /// `make` builds a tick message for the new generation on every fire.
    /// Returns the generation, which is stamped on outgoing interrupt
    /// callbacks.
    pub fn begin<T: Send + 'static>(
        &mut self,
        interval: Duration,
        tx: mpsc::Sender<T>,
        make: impl Fn(u64) -> T + Send + 'static,
    ) -> u64 {
        self.generation += 1;
        self.attempts = 0;
        let generation = self.generation;
        self.timer = Some(timer::periodic(interval, tx, move || make(generation)));
        generation
    }

    /// Accounts one timer tick for `generation`.
    pub fn tick(&mut self, generation: u64, limit: u32) -> TickOutcome {
        if generation != self.generation || self.timer.is_none() {
            return TickOutcome::Stale;
        }
        self.attempts += 1;
        if self.attempts >= limit {
            self.timer = None;
            TickOutcome::Expired
        } else {
            TickOutcome::Retransmit
        }
    }

    /// Ends the current cycle after all acknowledgments arrived.
    /// Cancelling an already-finished cycle is a no-op.
    pub fn complete(&mut self) {
        self.timer = None;
    }

    /// True while a retransmit timer is armed.
    pub fn is_active(&self) -> bool {
        self.timer.is_some()
    }

    /// Attempts counted so far in the current cycle.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_begin_bumps_generation() {
        let (tx, _rx) = mpsc::channel::<u64>(4);
        let mut st = InterruptState::new();
        let g1 = st.begin(Duration::from_millis(50), tx.clone(), |g| g);
        let g2 = st.begin(Duration::from_millis(50), tx, |g| g);
        assert_eq!(g1 + 1, g2);
        assert!(st.is_active());
    }

    #[tokio::test]
    async fn test_tick_counts_to_expiry() {
        let (tx, _rx) = mpsc::channel::<u64>(4);
        let mut st = InterruptState::new();
        let gen = st.begin(Duration::from_millis(50), tx, |g| g);

        assert_eq!(st.tick(gen, 3), TickOutcome::Retransmit);
        assert_eq!(st.tick(gen, 3), TickOutcome::Retransmit);
        assert_eq!(st.tick(gen, 3), TickOutcome::Expired);
        assert!(!st.is_active());
    }

    #[tokio::test]
    async fn test_stale_generation_discarded() {
        let (tx, _rx) = mpsc::channel::<u64>(4);
        let mut st = InterruptState::new();
        let old = st.begin(Duration::from_millis(50), tx.clone(), |g| g);
        let _new = st.begin(Duration::from_millis(50), tx, |g| g);

        assert_eq!(st.tick(old, 3), TickOutcome::Stale);
        assert_eq!(st.attempts(), 0);
    }

    #[tokio::test]
    async fn test_tick_after_complete_is_stale() {
        let (tx, _rx) = mpsc::channel::<u64>(4);
        let mut st = InterruptState::new();
        let gen = st.begin(Duration::from_millis(50), tx, |g| g);
        st.complete();

        assert_eq!(st.tick(gen, 3), TickOutcome::Stale);
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let (tx, _rx) = mpsc::channel::<u64>(4);
        let mut st = InterruptState::new();
        st.begin(Duration::from_millis(50), tx, |g| g);
        st.complete();
        st.complete();
        assert!(!st.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_delivers_generation_ticks() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut st = InterruptState::new();
        let gen = st.begin(Duration::from_millis(25), tx, |g| g);

        assert_eq!(rx.recv().await, Some(gen));
        assert_eq!(rx.recv().await, Some(gen));
        st.complete();
    }
}
