//! Calendar month keys (`YYYY-MM`) used to address snapshots

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A calendar month, ordered chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth {
    year: i32,
    month: u32,
}

/// Years addressable as a four-digit `YYYY` key
const YEARS: std::ops::RangeInclusive<i32> = 1..=9999;

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (YEARS.contains(&year) && (1..=12).contains(&month)).then_some(Self { year, month })
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn of_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// Month containing `instant` on the calendar of `tz`.
    pub fn containing(instant: DateTime<Utc>, tz: Tz) -> Self {
        Self::of_date(instant.with_timezone(&tz).date_naive())
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    pub fn prev(&self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).expect("month is validated on construction")
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date.year() == self.year && date.month() == self.month
    }

    /// Half-open UTC bounds of this month on the calendar of `tz`.
    ///
    /// Local midnight can be skipped by a DST transition; the earliest valid
    /// instant after it is used.
    pub fn bounds(&self, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
        (local_midnight(self.first_day(), tz), local_midnight(self.next().first_day(), tz))
    }

    /// All months from `start` up to but excluding `end`.
    pub fn range(start: YearMonth, end: YearMonth) -> Vec<YearMonth> {
        let mut months = Vec::new();
        let mut current = start;
        while current < end {
            months.push(current);
            current = current.next();
        }
        months
    }
}

fn local_midnight(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let mut naive = date.and_time(NaiveTime::MIN);
    // Gaps are at most a couple of hours; walk forward until the zone maps it.
    for _ in 0..24 {
        if let Some(local) = tz.from_local_datetime(&naive).earliest() {
            return local.with_timezone(&Utc);
        }
        naive += chrono::Duration::minutes(30);
    }
    naive.and_utc()
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for YearMonth {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (year, month) = s
            .split_once('-')
            .with_context(|| format!("Invalid month '{}', expected YYYY-MM", s))?;
        let year: i32 = year.parse().with_context(|| format!("Invalid year in '{}'", s))?;
        let month: u32 = month.parse().with_context(|| format!("Invalid month in '{}'", s))?;
        YearMonth::new(year, month).with_context(|| format!("Month out of range in '{}'", s))
    }
}

impl Serialize for YearMonth {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for YearMonth {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ym(s: &str) -> YearMonth {
        s.parse().unwrap()
    }

    #[test]
    fn parses_and_formats() {
        assert_eq!(ym("2025-03").to_string(), "2025-03");
        assert!("2025-13".parse::<YearMonth>().is_err());
        assert!("2025".parse::<YearMonth>().is_err());
    }

    #[test]
    fn rejects_years_outside_four_digits() {
        assert!("300000-01".parse::<YearMonth>().is_err());
        assert!("0000-06".parse::<YearMonth>().is_err());
        assert!("-5-01".parse::<YearMonth>().is_err());
        assert_eq!(ym("9999-12").next().first_day().year(), 10000);
    }

    #[test]
    fn steps_across_year_boundary() {
        assert_eq!(ym("2025-12").next(), ym("2026-01"));
        assert_eq!(ym("2026-01").prev(), ym("2025-12"));
    }

    #[test]
    fn range_excludes_end() {
        let months = YearMonth::range(ym("2025-11"), ym("2026-02"));
        assert_eq!(months, vec![ym("2025-11"), ym("2025-12"), ym("2026-01")]);
        assert!(YearMonth::range(ym("2026-02"), ym("2026-02")).is_empty());
    }

    #[test]
    fn bounds_follow_local_calendar() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let (start, end) = ym("2025-07").bounds(tz);
        assert_eq!(start.to_rfc3339(), "2025-07-01T04:00:00+00:00");
        assert_eq!(end.to_rfc3339(), "2025-08-01T04:00:00+00:00");
    }

    #[test]
    fn containing_uses_local_date() {
        let tz: Tz = "America/New_York".parse().unwrap();
        // 02:00 UTC on Aug 1 is still July 31 in New York
        let instant = "2025-08-01T02:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(YearMonth::containing(instant, tz), ym("2025-07"));
        assert_eq!(YearMonth::containing(instant, Tz::UTC), ym("2025-08"));
    }
}
