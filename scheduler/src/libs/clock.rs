//! An injectable clock so debounce logic can be tested deterministically

use chrono::prelude::*;

/// A source of the current wall clock time
pub trait Clock: Send + Sync {
    /// Get the current time
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    /// Get the current time
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
