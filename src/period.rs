//! Inclusive calendar date ranges used by evidence export and immutability checks.

use crate::error::ConfigError;
use chrono::{Datelike, Duration, NaiveDate};
use serde::Serialize;
use std::fmt;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, ConfigError> {
        if start > end {
            return Err(ConfigError::Validation(format!(
                "start date {} is after end date {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Parse `YYYY-MM-DD` bounds.
    pub fn parse(start: &str, end: &str) -> Result<Self, ConfigError> {
        Self::new(parse_date(start)?, parse_date(end)?)
    }

    /// From `days` days before `end` through `end`.
    pub fn trailing(days: i64, end: NaiveDate) -> Self {
        Self {
            start: end - Duration::days(days),
            end,
        }
    }

    /// Quarter of the start date, e.g. `(2026, "Q1")`.
    pub fn quarter(&self) -> (i32, String) {
        (self.start.year(), format!("Q{}", (self.start.month() - 1) / 3 + 1))
    }

    pub fn start_bound(&self) -> String {
        format!("{}T00:00:00Z", self.start.format(DATE_FORMAT))
    }

    pub fn end_bound(&self) -> String {
        format!("{}T23:59:59Z", self.end.format(DATE_FORMAT))
    }

    /// OData filter selecting `field` within the range.
    pub fn filter(&self, field: &str) -> String {
        format!("{} ge {} and {} le {}", field, self.start_bound(), field, self.end_bound())
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.start.format(DATE_FORMAT), self.end.format(DATE_FORMAT))
    }
}

pub fn parse_date(raw: &str) -> Result<NaiveDate, ConfigError> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT)
        .map_err(|e| ConfigError::Validation(format!("invalid date '{}' (expected YYYY-MM-DD): {}", raw, e)))
}
