//! Injectable time source.

use chrono::{Local, NaiveDate, NaiveDateTime};

/// Anything that can tell the current local time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// A clock frozen at a given instant. Used by tests and scheduled replays.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDateTime);

impl FixedClock {
    /// Convenience for a clock at `hour:00` on an arbitrary fixed date.
    pub fn at_hour(hour: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(2024, 1, 2)?
            .and_hms_opt(hour, 0, 0)
            .map(Self)
    }
}

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}
