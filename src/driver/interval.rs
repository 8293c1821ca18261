use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unit of sync granularity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Granularity {
    /// Sentinel: the whole dataset at once.
    All,
    Hour,
    Day,
    Month,
    Year,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::All => "ALL",
            Granularity::Hour => "HOUR",
            Granularity::Day => "DAY",
            Granularity::Month => "MONTH",
            Granularity::Year => "YEAR",
        }
    }

    /// Truncates `t` to the start of the granularity window containing it.
    pub fn lower(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Granularity::All => DateTime::<Utc>::UNIX_EPOCH,
            Granularity::Hour => utc(t.year(), t.month(), t.day(), t.hour()),
            Granularity::Day => utc(t.year(), t.month(), t.day(), 0),
            Granularity::Month => utc(t.year(), t.month(), 1, 0),
            Granularity::Year => utc(t.year(), 1, 1, 0),
        }
    }

    /// Exclusive end of the window starting at `lower`. `None` for [`Granularity::All`].
    pub fn upper(&self, lower: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Granularity::All => None,
            Granularity::Hour => Some(lower + Duration::hours(1)),
            Granularity::Day => Some(lower + Duration::days(1)),
            Granularity::Month => {
                let (year, month) = if lower.month() == 12 {
                    (lower.year() + 1, 1)
                } else {
                    (lower.year(), lower.month() + 1)
                };
                Some(utc(year, month, 1, 0))
            }
            Granularity::Year => Some(utc(lower.year() + 1, 1, 1, 0)),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn utc(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Immutable sync window: a granularity plus the start of the window.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeInterval {
    granularity: Granularity,
    start: DateTime<Utc>,
}

impl TimeInterval {
    /// Builds the interval of `granularity` that contains `t`.
    pub fn new(granularity: Granularity, t: DateTime<Utc>) -> Self {
        Self {
            granularity,
            start: granularity.lower(t),
        }
    }

    /// The "entire dataset" sentinel.
    pub fn all() -> Self {
        Self::new(Granularity::All, DateTime::<Utc>::UNIX_EPOCH)
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn is_all(&self) -> bool {
        self.granularity == Granularity::All
    }

    pub fn lower_endpoint(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn upper_endpoint(&self) -> Option<DateTime<Utc>> {
        self.granularity.upper(self.start)
    }

    /// Stable key used when storing per-interval sync status.
    pub fn key(&self) -> String {
        if self.is_all() {
            Granularity::All.as_str().to_string()
        } else {
            format!("{}:{}", self.granularity, self.start.to_rfc3339())
        }
    }
}

impl fmt::Display for TimeInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}
