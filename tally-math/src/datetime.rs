//! Date and moment handling for annotations and price history
//!
//! Annotation dates are plain calendar dates; price-history entries are
//! keyed by a naive UTC moment. Parsing accepts the handful of date formats
//! commodity annotations are written in.

use chrono::{NaiveDate, NaiveDateTime, Utc};
use thiserror::Error;

/// Calendar date used by lot annotations.
pub type Date = NaiveDate;

/// Timestamp used by price histories and quote lookups.
pub type Moment = NaiveDateTime;

/// Errors that can occur during date parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DateTimeError {
    /// The input matched none of the supported date formats.
    #[error("Invalid date format: {0}")]
    InvalidFormat(String),
}

/// Result type for date operations.
pub type DateTimeResult<T> = Result<T, DateTimeError>;

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d", // 2006-12-25
    "%Y/%m/%d", // 2006/12/25
    "%Y.%m.%d", // 2006.12.25
];

/// Parse a date, trying each supported format in order.
pub fn parse_date(input: &str) -> DateTimeResult<Date> {
    let trimmed = input.trim();
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Ok(date);
        }
    }
    Err(DateTimeError::InvalidFormat(input.to_string()))
}

/// Render a date in the canonical ISO form used by annotation keys.
pub fn format_date(date: &Date) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// The current moment, as a naive UTC timestamp.
pub fn now() -> Moment {
    Utc::now().naive_utc()
}
