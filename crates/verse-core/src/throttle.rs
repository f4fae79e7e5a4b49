//! Outbound rate limiting for position broadcasts.
//!
//! The gate is owned by the replicator instance and parameterized by an
//! injected clock, so tests drive it with a synthetic timeline.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Monotonic time source.
pub trait Clock: Send + Sync {
    /// Elapsed time since some fixed origin.
    fn now(&self) -> Duration;
}

/// Production clock backed by `Instant`.
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Minimum-interval gate: at most one permit per window.
///
/// Suppressed calls are dropped, not queued; a high-frequency caller
/// loses intermediate samples rather than accumulating lag.
pub struct SendGate {
    clock: Arc<dyn Clock>,
    min_interval: Duration,
    last: Mutex<Option<Duration>>,
}

impl SendGate {
    pub fn new(clock: Arc<dyn Clock>, min_interval: Duration) -> Self {
        Self {
            clock,
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// Returns `true` and consumes the window if enough time has passed
    /// since the last accepted call.
    pub fn permit(&self) -> bool {
        let now = self.clock.now();
        let mut last = self.last.lock().unwrap();
        let allowed = match *last {
            Some(prev) => now
                .checked_sub(prev)
                .is_none_or(|elapsed| elapsed >= self.min_interval),
            None => true,
        };
        if allowed {
            *last = Some(now);
        }
        allowed
    }
}
