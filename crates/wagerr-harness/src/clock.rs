//! Process-wide simulated clock.
//!
//! One non-decreasing value per test run, mirrored into every node. Zero
//! means "disabled" (daemons use wall-clock time). Only ever move it
//! forward while any node is running; per-node monotonicity is enforced at
//! the node handle.

use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug, Default)]
pub struct MockClock {
    now: AtomicI64,
}

impl MockClock {
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn current(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    pub fn is_enabled(&self) -> bool {
        self.current() != 0
    }

    /// Absolute set, used at genesis and when adopting a cached chain's
    /// deterministic timestamps.
    pub fn reset(&self, timestamp: i64) {
        self.now.store(timestamp, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.now.store(0, Ordering::SeqCst);
    }

    /// Advance by `delta` seconds and return the new value.
    pub fn advance(&self, delta: i64) -> i64 {
        self.now.fetch_add(delta, Ordering::SeqCst) + delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_returns_new_value() {
        let clock = MockClock::new(100);
        assert_eq!(clock.advance(5), 105);
        assert_eq!(clock.current(), 105);
    }

    #[test]
    fn disabled_clock_reads_zero() {
        let clock = MockClock::new(100);
        clock.disable();
        assert!(!clock.is_enabled());
        assert_eq!(clock.current(), 0);
    }

    #[test]
    fn reset_is_absolute() {
        let clock = MockClock::new(10);
        clock.reset(1_524_496_462);
        assert_eq!(clock.current(), 1_524_496_462);
    }
}
