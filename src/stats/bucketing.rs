//! Calendar bucket bounds for day-range and time-window filters.
//!
//! All bounds are naive local wall-clock timestamps: a day spans
//! `00:00:00.000000` through `23:59:59.999999` inclusive, weeks start on
//! Monday.

use chrono::{Datelike, Days, Months, NaiveDate, NaiveDateTime, NaiveTime};

/// Last representable microsecond of a day.
const END_OF_DAY: NaiveTime = match NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999) {
    Some(t) => t,
    None => NaiveTime::MIN,
};

/// Filter keys that resolve to a window around the current time.
pub const RANGE_KEYS: [&str; 4] = ["range_today", "range_week", "range_month", "range_year"];

/// Window anchored at the current time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TimeWindow {
    Today,
    Week,
    Month,
    Year,
}

impl TimeWindow {
    /// Parse a range key (`range_week`) or its bare suffix (`week`).
    pub fn from_key(key: &str) -> Option<Self> {
        match key.strip_prefix("range_").unwrap_or(key) {
            "today" => Some(Self::Today),
            "week" => Some(Self::Week),
            "month" => Some(Self::Month),
            "year" => Some(Self::Year),
            _ => None,
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            Self::Today => "range_today",
            Self::Week => "range_week",
            Self::Month => "range_month",
            Self::Year => "range_year",
        }
    }

    /// Inclusive `(start, end)` of the window containing `now`.
    pub fn bounds(&self, now: NaiveDateTime) -> Option<(NaiveDateTime, NaiveDateTime)> {
        let today = now.date();
        let (first, last) = match self {
            Self::Today => (today, today),
            Self::Week => {
                let monday =
                    today.checked_sub_days(Days::new(today.weekday().num_days_from_monday().into()))?;
                (monday, monday.checked_add_days(Days::new(6))?)
            }
            Self::Month => {
                let first = NaiveDate::from_ymd_opt(today.year(), today.month(), 1)?;
                let last = first.checked_add_months(Months::new(1))?.pred_opt()?;
                (first, last)
            }
            Self::Year => (
                NaiveDate::from_ymd_opt(today.year(), 1, 1)?,
                NaiveDate::from_ymd_opt(today.year(), 12, 31)?,
            ),
        };
        Some((start_of_day(first), end_of_day(last)))
    }
}

/// Whether `key` is one of the well-known range keys.
pub fn is_range_key(key: &str) -> bool {
    RANGE_KEYS.contains(&key)
}

pub fn start_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

pub fn end_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_time(END_OF_DAY)
}

/// Inclusive bounds of the calendar day containing `date`.
pub fn day_bounds(date: NaiveDate) -> (NaiveDateTime, NaiveDateTime) {
    (start_of_day(date), end_of_day(date))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
