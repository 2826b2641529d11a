//! Time unit switch between production (hours) and development (minutes).
//!
//! Development mode is not a faster clock: every quantity that is "per hour"
//! in production becomes "per minute", sessions per day collapse to one and
//! the history cycle shrinks from a calendar day to a minute.

use chrono::{DateTime, Duration, Utc};

use crate::constants::{DEVELOPMENT_SESSIONS_PER_DAY, SESSIONS_PER_DAY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeUnit {
    #[default]
    Hours,
    Minutes,
}

impl TimeUnit {
    pub fn from_development(development: bool) -> Self {
        if development { Self::Minutes } else { Self::Hours }
    }

    /// Length of one accrual unit.
    pub fn unit(&self) -> Duration {
        match self {
            Self::Hours => Duration::hours(1),
            Self::Minutes => Duration::minutes(1),
        }
    }

    /// `elapsed` expressed in accrual units. Negative spans count as zero.
    pub fn fraction(&self, elapsed: Duration) -> f64 {
        let ms = elapsed.num_milliseconds();
        if ms <= 0 {
            return 0.0;
        }
        ms as f64 / self.unit().num_milliseconds() as f64
    }

    /// Units between `from` and `to`, zero when `to` is not after `from`.
    pub fn between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
        self.fraction(to - from)
    }

    pub fn sessions_per_day(&self) -> f64 {
        match self {
            Self::Hours => SESSIONS_PER_DAY,
            Self::Minutes => DEVELOPMENT_SESSIONS_PER_DAY,
        }
    }

    /// Length of one history cycle: a calendar day, or a minute in development.
    pub fn cycle(&self) -> Duration {
        match self {
            Self::Hours => Duration::days(1),
            Self::Minutes => Duration::minutes(1),
        }
    }

    /// Start of the history cycle containing `at`.
    pub fn cycle_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        truncate(at, self.cycle())
    }

    /// Whether a cycle boundary lies in `(from, to]`.
    pub fn crossed_cycle(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        to > from && self.cycle_start(from) != self.cycle_start(to)
    }

    /// Start of the ledger bucket containing `at` (one accrual unit wide).
    pub fn bucket_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        truncate(at, self.unit())
    }
}

fn truncate(at: DateTime<Utc>, step: Duration) -> DateTime<Utc> {
    let step_secs = step.num_seconds().max(1);
    let secs = at.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(step_secs), 0).unwrap_or(at)
}
