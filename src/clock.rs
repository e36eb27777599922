//! Injectable time source.
//!
//! All expiry logic works on i64 unix seconds so tests can drive the clock
//! deterministically instead of sleeping through lockout windows.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    fn now_unix(&self) -> i64;
}

/// Wall-clock time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| {
                i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX)
            })
    }
}

/// Manually advanced clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    now_unix: AtomicI64,
}

impl ManualClock {
    #[must_use]
    pub fn new(now_unix: i64) -> Self {
        Self {
            now_unix: AtomicI64::new(now_unix),
        }
    }

    pub fn advance(&self, seconds: i64) {
        self.now_unix.fetch_add(seconds, Ordering::SeqCst);
    }

    pub fn set(&self, now_unix: i64) {
        self.now_unix.store(now_unix, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_unix(&self) -> i64 {
        self.now_unix.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_past_2024() {
        assert!(SystemClock.now_unix() > 1_700_000_000);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now_unix(), 100);
        clock.advance(50);
        assert_eq!(clock.now_unix(), 150);
        clock.set(10);
        assert_eq!(clock.now_unix(), 10);
    }
}
