//! Injectable time sources.
//!
//! Every expiry window, settle period, and cache lifetime in the crate reads time
//! through [`TimeSource`]. Production code uses [`SystemClock`]; tests drive a
//! [`ManualClock`] whose sleeps advance simulated time instead of blocking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, SystemTime};

use crate::types::{duration_nanos, Timestamp};

/// Source of wall-clock timestamps.
pub trait TimeSource: Send + Sync {
    /// Current time.
    fn now(&self) -> Timestamp;

    /// Blocks until the clock reads strictly later than `deadline` and returns that reading.
    fn sleep_past(&self, deadline: Timestamp) -> Timestamp;
}

/// Wall clock backed by [`SystemTime`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now(&self) -> Timestamp {
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(duration_nanos)
            .unwrap_or(0);
        Timestamp(nanos)
    }

    fn sleep_past(&self, deadline: Timestamp) -> Timestamp {
        loop {
            let now = self.now();
            if now > deadline {
                return now;
            }
            thread::sleep(Duration::from_nanos(deadline.0 - now.0 + 1));
        }
    }
}

/// Simulated clock for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    /// Creates a clock reading `start`.
    pub fn new(start: Timestamp) -> Self {
        Self {
            nanos: AtomicU64::new(start.0),
        }
    }

    /// Moves time forward by `d`.
    pub fn advance(&self, d: Duration) {
        self.nanos.fetch_add(duration_nanos(d), Ordering::SeqCst);
    }

    /// Sets the current reading; time never moves backwards.
    pub fn set(&self, ts: Timestamp) {
        self.nanos.fetch_max(ts.0, Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.nanos.load(Ordering::SeqCst))
    }

    fn sleep_past(&self, deadline: Timestamp) -> Timestamp {
        self.nanos
            .fetch_max(deadline.0.saturating_add(1), Ordering::SeqCst);
        self.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_sleep_moves_past_deadline() {
        let clock = ManualClock::new(Timestamp::from_millis(1_000));
        let woke = clock.sleep_past(Timestamp::from_millis(1_100));
        assert!(woke > Timestamp::from_millis(1_100));
        // Deadlines already in the past do not rewind or stall.
        let again = clock.sleep_past(Timestamp::from_millis(10));
        assert_eq!(again, woke);
    }

    #[test]
    fn system_clock_sleep_past_returns_later_reading() {
        let clock = SystemClock;
        let deadline = clock.now().plus(Duration::from_millis(2));
        assert!(clock.sleep_past(deadline) > deadline);
    }
}
