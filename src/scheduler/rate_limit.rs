//! Per-worker cooldown after the endpoint throttles us.
//!
//! When a worker's endpoint answers 429, that worker stops admitting work
//! until the cooldown the endpoint asked for has elapsed. Other workers are
//! unaffected.

use std::time::{Duration, Instant};

/// Cooldown state owned by one worker.
#[derive(Debug, Default)]
pub struct RateLimitState {
    /// When admission may resume (None = no active cooldown).
    pub backoff_until: Option<Instant>,
    /// Number of consecutive rate limit results.
    pub consecutive_hits: u32,
}

impl RateLimitState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if the cooldown is still running at `now`.
    pub fn is_cooling_down(&self, now: Instant) -> bool {
        self.backoff_until.map(|until| now < until).unwrap_or(false)
    }

    /// Get remaining cooldown if any.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.backoff_until
            .and_then(|until| if now < until { Some(until - now) } else { None })
    }

    /// Record a rate limit result.
    ///
    /// A later deadline never gets shortened by a smaller cooldown that
    /// arrives afterwards from another in-flight request.
    pub fn record_rate_limit(&mut self, now: Instant, cooldown: Duration) {
        self.consecutive_hits += 1;
        let until = now + cooldown;
        self.backoff_until = Some(self.backoff_until.map_or(until, |current| current.max(until)));

        tracing::warn!(
            cooldown_ms = cooldown.as_millis() as u64,
            consecutive_hits = self.consecutive_hits,
            "Rate limited, suspending admission"
        );
    }

    /// Record a successful call.
    ///
    /// Resets the consecutive hit counter. An active cooldown stays in place:
    /// a success that was already in flight says nothing about the throttle.
    pub fn record_success(&mut self) {
        self.consecutive_hits = 0;
    }
}
