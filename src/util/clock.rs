//! Clock abstraction for testable time
//!
//! Every timeout, expiry and timestamp in the node is read from a single
//! [`Clock`] so tests can drive the engine with simulated time.

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Source of wall clock time
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_ms(&self) -> i64;

    /// Seconds since the Unix epoch
    fn now(&self) -> i64 {
        self.now_ms().div_euclid(1000)
    }
}

/// Clock handle shared by every component of a node
pub type SharedClock = Arc<dyn Clock>;

/// Real system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn shared() -> SharedClock {
        Arc::new(SystemClock)
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Manually driven clock for tests
#[derive(Debug, Default)]
pub struct MockClock {
    time_ms: AtomicI64,
}

impl MockClock {
    /// Create a mock clock starting at `time_secs` (Unix seconds)
    pub fn new(time_secs: i64) -> Arc<Self> {
        Arc::new(Self {
            time_ms: AtomicI64::new(time_secs * 1000),
        })
    }

    /// Jump to an absolute time in seconds
    pub fn set(&self, time_secs: i64) {
        self.time_ms.store(time_secs * 1000, Ordering::SeqCst);
    }

    /// Move time forward
    pub fn advance(&self, by: Duration) {
        self.time_ms
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> i64 {
        self.time_ms.load(Ordering::SeqCst)
    }
}
