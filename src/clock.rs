//! Monotonic wall-time source for lease expiry comparisons.
//!
//! The engine never calls `chrono::Utc::now()` directly — every timestamp
//! that feeds a lease comparison or a threshold decision goes through a
//! `Clock`, so tests can fix time without sleeping.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Millisecond-precision wall clock, matching the storage layer's
/// millisecond-precision date columns (§4.1).
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// Default clock backed by the OS wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Deterministic clock for tests. `advance` moves time forward explicitly;
/// nothing in the engine sleeps on wall time, so this is sufficient to
/// exercise lease expiry and heartbeat extension paths deterministically.
#[derive(Debug, Default)]
pub struct FixedClock {
    millis: AtomicI64,
}

impl FixedClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        self.millis.fetch_add(delta.num_milliseconds(), Ordering::SeqCst);
    }

    pub fn set(&self, when: DateTime<Utc>) {
        self.millis.store(when.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst))
            .unwrap_or_else(Utc::now)
    }
}
