//! Time sources and local calendar handling.

use std::sync::Mutex;

use chrono::{DateTime, Duration, FixedOffset, Local, NaiveDate, TimeZone, Timelike, Utc};

use crate::directory::DateRange;

/// Source of the current instant.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Used to drive ticks in tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Start at `at`.
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(at) }
    }

    /// Jump to `at`.
    pub fn set(&self, at: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = at;
        }
    }

    /// Move forward by `by`.
    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
            .lock()
            .map_or_else(|poisoned| *poisoned.into_inner(), |now| *now)
    }
}

/// Time zone used for the digest hour and calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalZone {
    /// Fixed offset from UTC.
    Fixed(FixedOffset),
    /// The host's local time zone.
    System,
}

impl LocalZone {
    /// Fixed zone from an offset in minutes, or the system zone when unset.
    pub fn from_offset_minutes(minutes: Option<i32>) -> Option<Self> {
        match minutes {
            None => Some(Self::System),
            Some(m) => FixedOffset::east_opt(m * 60).map(Self::Fixed),
        }
    }

    /// Local wall-clock hour of `at`.
    pub fn hour(self, at: DateTime<Utc>) -> u32 {
        match self {
            Self::Fixed(offset) => at.with_timezone(&offset).hour(),
            Self::System => at.with_timezone(&Local).hour(),
        }
    }

    /// Local calendar date of `at`.
    pub fn date(self, at: DateTime<Utc>) -> NaiveDate {
        match self {
            Self::Fixed(offset) => at.with_timezone(&offset).date_naive(),
            Self::System => at.with_timezone(&Local).date_naive(),
        }
    }

    /// `[start, end)` of a local calendar day, in UTC.
    pub fn day_range(self, date: NaiveDate) -> DateRange {
        let next = date.succ_opt().unwrap_or(date);
        DateRange {
            start: self.start_of(date),
            end: self.start_of(next),
        }
    }

    fn start_of(self, date: NaiveDate) -> DateTime<Utc> {
        let midnight = date.and_time(chrono::NaiveTime::MIN);
        match self {
            Self::Fixed(offset) => offset
                .from_local_datetime(&midnight)
                .earliest()
                .map_or_else(|| midnight.and_utc(), |dt| dt.with_timezone(&Utc)),
            // A DST gap can swallow midnight; fall back to treating it as UTC
            Self::System => Local
                .from_local_datetime(&midnight)
                .earliest()
                .map_or_else(|| midnight.and_utc(), |dt| dt.with_timezone(&Utc)),
        }
    }
}
