//! Clock and timer service.
//!
//! Monotonic time plus one-shot and periodic timers that deliver a message
//! on an mpsc channel when they fire. Handles cancel idempotently and
//! cancel on drop, so re-arming a timer slot never leaves a stale task
//! behind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Returns the current monotonic time.
///
/// Uses `tokio::time::Instant` so paused-clock tests control it.
pub fn now() -> Instant {
    Instant::now()
}

/// Handle to an armed timer. Cancel is idempotent; drop cancels.
#[derive(Debug)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Cancels the timer. Safe to call more than once, and safe to call
    /// after the timer has already fired.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.task.abort();
        }
    }

    /// True once `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Arms a one-shot timer that sends `msg` on `tx` after `after`.
pub fn one_shot<T: Send + 'static>(
    after: Duration,
    tx: mpsc::Sender<T>,
    msg: T,
) -> TimerHandle {
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = cancelled.clone();
    let task = tokio::spawn(async move {
        tokio::time::sleep(after).await;
        if !flag.load(Ordering::SeqCst) {
            let _ = tx.send(msg).await;
        }
    });
    TimerHandle { cancelled, task }
}

/// Arms a periodic timer that sends a fresh `make()` message on `tx`
/// every `every`, until cancelled or the receiver goes away.
///
/// Building the message per tick keeps the payload type free of a
/// `Clone` bound; op enums carrying oneshot reply channels go through
/// here unchanged.
pub fn periodic<T: Send + 'static>(
    every: Duration,
    tx: mpsc::Sender<T>,
    make: impl Fn() -> T + Send + 'static,
) -> TimerHandle {
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = cancelled.clone();
    let task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(every).await;
            if flag.load(Ordering::SeqCst) {
                break;
            }
            if tx.send(make()).await.is_err() {
                break;
            }
        }
    });
    TimerHandle { cancelled, task }
}
