//! Calendar handling for model time.
//!
//! Time parameters are stored as seconds since 1970-01-01 00:00:00 (negative before that).
//! Timesteps are either a whole number of seconds or a whole number of months.

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimestepUnit {
    Second,
    Month,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestepSize {
    pub unit: TimestepUnit,
    pub magnitude: i32,
}

impl Default for TimestepSize {
    fn default() -> Self {
        Self::days(1)
    }
}

impl TimestepSize {
    pub fn seconds(magnitude: i32) -> Self {
        Self {
            unit: TimestepUnit::Second,
            magnitude,
        }
    }

    pub fn days(days: i32) -> Self {
        Self::seconds(days * 86400)
    }

    pub fn months(magnitude: i32) -> Self {
        Self {
            unit: TimestepUnit::Month,
            magnitude,
        }
    }
}

/// Parses `yyyy-mm-dd` or `yyyy-mm-dd hh:mm:ss`.
pub fn parse_date(text: &str) -> Result<i64> {
    let text = text.trim();
    let datetime = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .map(|date| date.and_hms_opt(0, 0, 0).unwrap_or_default())
        })
        .map_err(|_| anyhow!("Unrecognized date format \"{}\". Expected yyyy-mm-dd.", text))?;
    Ok(datetime.and_utc().timestamp())
}

fn to_naive(seconds: i64) -> Result<NaiveDateTime> {
    DateTime::from_timestamp(seconds, 0)
        .map(|date| date.naive_utc())
        .ok_or_else(|| anyhow!("Timestamp {} is out of the supported date range.", seconds))
}

/// Formats as `yyyy-mm-dd`, adding ` hh:mm:ss` when the time of day is not midnight.
pub fn format_date(seconds: i64) -> String {
    match to_naive(seconds) {
        Ok(date) if date.num_seconds_from_midnight() == 0 => date.format("%Y-%m-%d").to_string(),
        Ok(date) => date.format("%Y-%m-%d %H:%M:%S").to_string(),
        Err(_) => format!("(invalid timestamp {seconds})"),
    }
}

fn add_months(seconds: i64, months: i32) -> Result<i64> {
    let date = to_naive(seconds)?;
    let shifted = if months >= 0 {
        date.checked_add_months(Months::new(months as u32))
    } else {
        date.checked_sub_months(Months::new(months.unsigned_abs()))
    };
    shifted
        .map(|d| d.and_utc().timestamp())
        .ok_or_else(|| anyhow!("Date arithmetic overflowed."))
}

/// Number of whole timesteps from `start` to `date` (negative if `date` is earlier).
pub fn find_timestep(start: i64, date: i64, step: TimestepSize) -> Result<i64> {
    if step.magnitude <= 0 {
        bail!("The timestep magnitude must be positive.");
    }
    match step.unit {
        TimestepUnit::Second => Ok((date - start).div_euclid(step.magnitude as i64)),
        TimestepUnit::Month => {
            let a = to_naive(start)?;
            let b = to_naive(date)?;
            let months = (b.year() - a.year()) as i64 * 12 + b.month() as i64 - a.month() as i64;
            Ok(months.div_euclid(step.magnitude as i64))
        }
    }
}

/// `date` moved by `steps` whole timesteps (backwards when negative).
pub fn shift_timesteps(date: i64, steps: i64, step: TimestepSize) -> Result<i64> {
    let total = steps
        .checked_mul(step.magnitude as i64)
        .ok_or_else(|| anyhow!("Date arithmetic overflowed."))?;
    match step.unit {
        TimestepUnit::Second => date
            .checked_add(total)
            .ok_or_else(|| anyhow!("Date arithmetic overflowed.")),
        TimestepUnit::Month => {
            let months = i32::try_from(total).map_err(|_| anyhow!("Date arithmetic overflowed."))?;
            add_months(date, months)
        }
    }
}

/// The model clock, with the calendar fields equation bodies usually need.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExpandedDateTime {
    pub seconds_since_epoch: i64,
    pub year: i32,
    pub month: u32,
    pub day_of_month: u32,
    /// Starting at 1 for January 1st.
    pub day_of_year: u32,
    pub days_this_year: u32,
    pub days_this_month: u32,
    pub second_of_day: u32,
    /// Length of the current timestep in seconds.
    pub step_length_in_seconds: i64,
    pub step: TimestepSize,
}

impl ExpandedDateTime {
    pub fn new(seconds_since_epoch: i64, step: TimestepSize) -> Result<Self> {
        let mut result = Self {
            seconds_since_epoch,
            year: 1970,
            month: 1,
            day_of_month: 1,
            day_of_year: 1,
            days_this_year: 365,
            days_this_month: 31,
            second_of_day: 0,
            step_length_in_seconds: 0,
            step,
        };
        result.refresh()?;
        Ok(result)
    }

    fn refresh(&mut self) -> Result<()> {
        let date = to_naive(self.seconds_since_epoch)?;
        self.year = date.year();
        self.month = date.month();
        self.day_of_month = date.day();
        self.day_of_year = date.ordinal();
        self.days_this_year = if date.date().leap_year() { 366 } else { 365 };
        self.days_this_month = days_in_month(self.year, self.month);
        self.second_of_day = date.num_seconds_from_midnight();
        self.step_length_in_seconds = match self.step.unit {
            TimestepUnit::Second => self.step.magnitude as i64,
            TimestepUnit::Month => {
                add_months(self.seconds_since_epoch, self.step.magnitude)?
                    - self.seconds_since_epoch
            }
        };
        Ok(())
    }

    /// 1970-01-01 00:00:00, for contexts that have no real clock.
    pub(crate) fn epoch(step: TimestepSize) -> Self {
        Self {
            seconds_since_epoch: 0,
            year: 1970,
            month: 1,
            day_of_month: 1,
            day_of_year: 1,
            days_this_year: 365,
            days_this_month: 31,
            second_of_day: 0,
            step_length_in_seconds: match step.unit {
                TimestepUnit::Second => step.magnitude as i64,
                TimestepUnit::Month => 31 * 86400 * step.magnitude as i64,
            },
            step,
        }
    }

    pub fn advance(&mut self) -> Result<()> {
        self.seconds_since_epoch = match self.step.unit {
            TimestepUnit::Second => self.seconds_since_epoch + self.step.magnitude as i64,
            TimestepUnit::Month => add_months(self.seconds_since_epoch, self.step.magnitude)?,
        };
        self.refresh()
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    match (
        NaiveDate::from_ymd_opt(year, month, 1),
        NaiveDate::from_ymd_opt(next_year, next_month, 1),
    ) {
        (Some(a), Some(b)) => (b - a).num_days() as u32,
        _ => 30,
    }
}
