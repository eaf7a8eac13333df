//! Clock abstraction for determinism.

use chrono::{DateTime, Utc};

/// Abstraction over system time. Lock timestamps, stale-claim cutoffs and
/// record timestamps all read from an injected clock so tests can pin them.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock that delegates to the system clock.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
