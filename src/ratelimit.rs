//! Rate limiting for log statements on hot error paths.

use std::time::{Duration, Instant};

/// Allows one event per interval. Suppressed events are counted and the
/// count is reported with the next allowed event.
pub struct RateLimiter {
    interval: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            suppressed: 0,
        }
    }

    pub fn every_ms(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }

    /// Returns `Some(suppressed_since_last)` when the caller may log now.
    pub fn allow(&mut self) -> Option<u64> {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last = Some(now);
                let suppressed = self.suppressed;
                self.suppressed = 0;
                Some(suppressed)
            }
        }
    }
}
