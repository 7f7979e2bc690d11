//! Monotonic time source shared by the bridge, scheduler and dispatcher.

use std::time::Instant;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Reads tokio's clock, so paused-time tests see the same instants as the
/// deadline timers.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

#[cfg(test)]
pub use manual::ManualClock;
