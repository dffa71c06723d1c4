//! Restartable periodic callback.
//!
//! `set` runs the callback right away and then on a fixed heartbeat until
//! `unset` or the next `set`. `wake` runs the armed callback early without
//! restarting the heartbeat. Periods are measured tick to tick; drift is
//! tolerated, not corrected.
//!
//! Must be used from within a tokio runtime.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Default heartbeat interval.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub type PollCallback = Arc<dyn Fn() + Send + Sync>;

struct Armed {
    handle: JoinHandle<()>,
    wake: Arc<Notify>,
}

pub struct Poller {
    interval: Duration,
    armed: Mutex<Option<Armed>>,
}

impl Poller {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            armed: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Replace the callback, invoke it once now, then keep it on the heartbeat.
    pub fn set(&self, callback: PollCallback) {
        let wake = Arc::new(Notify::new());
        let handle = tokio::spawn(heartbeat(self.interval, callback.clone(), wake.clone()));

        let previous = self
            .armed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(Armed { handle, wake });
        if let Some(previous) = previous {
            previous.handle.abort();
        }

        callback();
    }

    /// Disarm. No-op when nothing is scheduled.
    pub fn unset(&self) {
        if let Some(armed) = self.armed.lock().unwrap_or_else(|e| e.into_inner()).take() {
            armed.handle.abort();
        }
    }

    /// Run the armed callback as soon as possible. No-op when unarmed.
    ///
    /// Returns whether a callback was armed.
    pub fn wake(&self) -> bool {
        match self.armed.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(armed) => {
                armed.wake.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }
}

impl Default for Poller {
    fn default() -> Self {
        Self::new(POLL_INTERVAL)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.unset();
    }
}

async fn heartbeat(period: Duration, callback: PollCallback, wake: Arc<Notify>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately; `set` already made the first call
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = wake.notified() => {}
        }
        callback();
    }
}
