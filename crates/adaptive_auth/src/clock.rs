//! Wall-clock abstraction
//!
//! Expiry, lockout windows and session TTLs all read time through [`Clock`]
//! so tests can drive them deterministically with [`ManualClock`].

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Source of the current physical time
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current UTC time
    fn now(&self) -> DateTime<Utc>;
}

/// System wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += to_chrono(by);
    }

    /// Jump to an absolute time
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Convert a std duration, capping out-of-range values at a thousand years
#[must_use]
pub fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::weeks(52 * 1000))
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;
