//! UTC calendar keys derived from epoch-millisecond timestamps.
//!
//! Reports bucket rows by these keys, so every backend must derive them the
//! same way: whole seconds are taken by truncating division (`ms / 1000`),
//! then converted to a UTC calendar date. Dates outside years 0000-9999 have
//! no key and never match a report filter.

use std::{fmt::Display, str::FromStr};

use time::{Date, Month, OffsetDateTime};

fn utc_date(timestamp_ms: i64) -> Option<Date> {
    let date = OffsetDateTime::from_unix_timestamp(timestamp_ms / 1000).ok()?.date();
    if (0..=9999).contains(&date.year()) {
        Some(date)
    } else {
        None
    }
}

/// `MM-yyyy` key of a timestamp.
pub fn month_year_key(timestamp_ms: i64) -> Option<String> {
    MonthYear::of(timestamp_ms).map(|m| m.to_string())
}

/// `yyyy-MM-dd` key of a timestamp.
pub fn day_key(timestamp_ms: i64) -> Option<String> {
    utc_date(timestamp_ms).map(|d| format!("{:04}-{:02}-{:02}", d.year(), d.month() as u8, d.day()))
}

/// The `MM-yyyy` key of the current UTC month.
pub fn current_month_year() -> String {
    let today = OffsetDateTime::now_utc().date();
    MonthYear { year: today.year(), month: today.month() }.to_string()
}

/// A calendar month parsed from its `MM-yyyy` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MonthYear {
    year: i32,
    month: Month,
}

impl MonthYear {
    pub fn of(timestamp_ms: i64) -> Option<Self> {
        utc_date(timestamp_ms).map(|d| Self { year: d.year(), month: d.month() })
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> Month {
        self.month
    }

    pub fn contains(&self, timestamp_ms: i64) -> bool {
        Self::of(timestamp_ms).as_ref() == Some(self)
    }
}

impl Display for MonthYear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}-{:04}", self.month as u8, self.year)
    }
}

impl FromStr for MonthYear {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("invalid month-year '{}', expected MM-yyyy", s);
        let (month, year) = s.split_once('-').ok_or_else(invalid)?;
        if month.len() != 2 || year.len() != 4 {
            return Err(invalid());
        }
        if !month.bytes().chain(year.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let month: u8 = month.parse().map_err(|_| invalid())?;
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let month = Month::try_from(month).map_err(|_| invalid())?;
        Ok(Self { year, month })
    }
}
