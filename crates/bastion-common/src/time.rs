//! ---
//! bastion_section: "01-core-functionality"
//! bastion_subsection: "module"
//! bastion_type: "source"
//! bastion_scope: "code"
//! bastion_description: "Shared primitives and utilities for the security runtime."
//! bastion_version: "v0.0.0-prealpha"
//! bastion_owner: "tbd"
//! ---
use std::fmt::Debug;

use chrono::{DateTime, Datelike, Duration, FixedOffset, Local, Offset, Timelike, Utc, Weekday};
use parking_lot::Mutex;

/// Source of wall-clock time for windowed security logic.
pub trait Clock: Send + Sync + Debug {
    /// Current instant in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the host system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and offline simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Jump to an absolute instant.
    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock() = instant;
    }

    /// Move the clock forward (or backward for negative durations).
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock();
        *now += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Time zone used when a rule talks about "local" hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalZone {
    /// Whatever zone the host is configured with.
    #[default]
    Host,
    /// A fixed offset from UTC.
    Fixed(FixedOffset),
}

impl LocalZone {
    /// Build a fixed zone from an offset in minutes east of UTC.
    pub fn from_offset_minutes(minutes: i32) -> Option<Self> {
        minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .map(LocalZone::Fixed)
    }

    /// UTC itself, convenient for deterministic tests.
    pub fn utc() -> Self {
        LocalZone::Fixed(Utc.fix())
    }

    /// Hour of day (0-23) of `instant` in this zone.
    pub fn hour(&self, instant: DateTime<Utc>) -> u32 {
        match self {
            LocalZone::Host => instant.with_timezone(&Local).hour(),
            LocalZone::Fixed(offset) => instant.with_timezone(offset).hour(),
        }
    }

    /// Day of week of `instant` in this zone.
    pub fn weekday(&self, instant: DateTime<Utc>) -> Weekday {
        match self {
            LocalZone::Host => instant.with_timezone(&Local).weekday(),
            LocalZone::Fixed(offset) => instant.with_timezone(offset).weekday(),
        }
    }

    /// Monday to Friday, local hour in `[9, 17)`.
    pub fn is_business_hours(&self, instant: DateTime<Utc>) -> bool {
        let weekday = self.weekday(instant);
        let hour = self.hour(instant);
        !matches!(weekday, Weekday::Sat | Weekday::Sun) && (9..17).contains(&hour)
    }
}
