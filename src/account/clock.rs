//! Time source

use chrono::{DateTime, Utc};

/// Source of the current time
pub trait Clock: Send + Sync {
    /// Unix time in seconds
    fn now(&self) -> u64;

    /// Unix time in milliseconds
    fn now_ms(&self) -> i64 {
        self.now() as i64 * 1000
    }

    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.now() as i64, 0).unwrap_or_default()
    }
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        Utc::now().timestamp().max(0) as u64
    }

    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub use fixed::FixedClock;

#[cfg(test)]
mod fixed {
    use super::Clock;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Clock that only moves when told to
    #[derive(Debug, Default)]
    pub struct FixedClock(AtomicU64);

    impl FixedClock {
        pub fn new(now: u64) -> Self {
            Self(AtomicU64::new(now))
        }

        pub fn set(&self, now: u64) {
            self.0.store(now, Ordering::SeqCst);
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }
}
