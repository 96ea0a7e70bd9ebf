//! Wall clock tied to the tokio timer.

use tether_engine::{Clock, SystemClock, Timestamp};
use tokio::time::Instant;

/// Epoch milliseconds that advance with tokio's clock.
///
/// Captures the wall time once and adds the elapsed tokio time, so under a
/// paused test runtime record and retry timestamps move with virtual time.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeClock {
    base: Timestamp,
    start: Instant,
}

impl RuntimeClock {
    /// Must be called inside a tokio runtime.
    pub fn new() -> Self {
        Self::starting_at(SystemClock.now())
    }

    pub fn starting_at(base: Timestamp) -> Self {
        Self {
            base,
            start: Instant::now(),
        }
    }
}

impl Default for RuntimeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for RuntimeClock {
    fn now(&self) -> Timestamp {
        let elapsed = u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.base.saturating_add(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn follows_virtual_time() {
        let clock = RuntimeClock::starting_at(1_000);
        assert_eq!(clock.now(), 1_000);

        tokio::time::advance(Duration::from_millis(2_500)).await;
        assert_eq!(clock.now(), 3_500);
    }
}
