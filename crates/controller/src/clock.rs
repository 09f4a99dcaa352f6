//! Monotonic time source and blocking-style sleep.
//!
//! Everything that waits goes through [`Clock`] so tests can run on tokio's
//! paused clock and assert on the exact durations requested.

use std::time::Duration;

use tokio::time::Instant;

pub(crate) trait Clock {
    /// Current monotonic instant.
    fn now(&self) -> Instant;

    /// Suspend the (single) control loop for `duration`.
    async fn sleep(&self, duration: Duration);

    /// Milliseconds elapsed since `since`, saturating at zero.
    fn elapsed_ms(&self, since: Instant) -> u64 {
        self.now().saturating_duration_since(since).as_millis() as u64
    }
}

/// Clock backed by the tokio timer wheel.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}
