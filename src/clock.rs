//! Wall-clock source used to stamp envelopes.
//!
//! The broker stores time series at nanosecond resolution, so every envelope
//! carries a nanosecond `sys_timestamp`. Chunk envelopes use float seconds.
//! The clock is injected so envelope construction stays deterministic in tests.

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Current Unix time in nanoseconds.
    fn now_ns(&self) -> i64;

    /// Current Unix time in (fractional) seconds.
    fn now_secs(&self) -> f64 {
        self.now_ns() as f64 / 1_000_000_000.0
    }
}

/// System wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ns(&self) -> i64 {
        unix_time_ns()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct FixedClock {
    now: AtomicI64,
}

impl FixedClock {
    /// Creates a clock frozen at `now_ns`.
    pub fn new(now_ns: i64) -> Self {
        Self {
            now: AtomicI64::new(now_ns),
        }
    }

    /// Moves the clock to `now_ns`.
    pub fn set(&self, now_ns: i64) {
        self.now.store(now_ns, Ordering::SeqCst);
    }

    /// Advances the clock by `delta_ns`.
    pub fn advance(&self, delta_ns: i64) {
        self.now.fetch_add(delta_ns, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_ns(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Unix time in nanoseconds.
///
/// Saturates at `i64::MAX` for dates past 2262, which chrono cannot represent
/// in nanoseconds.
pub fn unix_time_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_moves_only_on_request() {
        let clock = FixedClock::new(1_000);
        assert_eq!(clock.now_ns(), 1_000);
        clock.advance(500);
        assert_eq!(clock.now_ns(), 1_500);
        clock.set(3_000_000_000);
        assert!((clock.now_secs() - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn system_clock_is_after_2020() {
        // 2020-01-01T00:00:00Z
        assert!(SystemClock.now_ns() > 1_577_836_800_000_000_000);
    }
}
