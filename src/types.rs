//! Core value types shared across the gateway
//!
//! - `TimeRange`: half-open `[start, end)` interval in epoch milliseconds
//! - `TimeUnit` / `Duration`: KairosDB-style `{value, unit}` durations used by
//!   relative query windows, aggregator sampling and rollup intervals
//! - `DataValue`: a single sample value as decoded from the backend

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Time range for queries (half-open interval: [start, end))
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive), in milliseconds
    pub start: i64,
    /// End timestamp (exclusive), in milliseconds
    pub end: i64,
}

impl TimeRange {
    /// Create a new time range
    ///
    /// # Panics
    /// Panics if start > end
    pub fn new(start: i64, end: i64) -> Self {
        assert!(start <= end, "TimeRange: start must not be after end");
        Self { start, end }
    }

    /// Create a time range, returning None if start > end
    pub fn try_new(start: i64, end: i64) -> Option<Self> {
        if start <= end {
            Some(Self { start, end })
        } else {
            None
        }
    }

    /// Create a range for the last N milliseconds ending now
    pub fn last_millis(millis: i64) -> Self {
        let end = now_millis();
        Self {
            start: end.saturating_sub(millis.max(0)),
            end,
        }
    }

    /// Check if a timestamp falls within this range
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// Whether the range covers no instant at all
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Get the duration in milliseconds
    pub fn duration_millis(&self) -> i64 {
        self.end.saturating_sub(self.start)
    }

    /// Get intersection with another range, if any
    pub fn intersection(&self, other: &TimeRange) -> Option<Self> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start < end {
            Some(Self { start, end })
        } else {
            None
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Units accepted in `{value, unit}` durations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
    Years,
}

impl TimeUnit {
    /// Length of one unit in milliseconds (months = 30 days, years = 365 days)
    pub fn millis(&self) -> i64 {
        match self {
            TimeUnit::Milliseconds => 1,
            TimeUnit::Seconds => 1_000,
            TimeUnit::Minutes => 60_000,
            TimeUnit::Hours => 3_600_000,
            TimeUnit::Days => 86_400_000,
            TimeUnit::Weeks => 7 * 86_400_000,
            TimeUnit::Months => 30 * 86_400_000,
            TimeUnit::Years => 365 * 86_400_000,
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeUnit::Milliseconds => "milliseconds",
            TimeUnit::Seconds => "seconds",
            TimeUnit::Minutes => "minutes",
            TimeUnit::Hours => "hours",
            TimeUnit::Days => "days",
            TimeUnit::Weeks => "weeks",
            TimeUnit::Months => "months",
            TimeUnit::Years => "years",
        };
        write!(f, "{}", s)
    }
}

/// A `{value, unit}` duration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Duration {
    pub value: i64,
    pub unit: TimeUnit,
}

impl Duration {
    pub fn new(value: i64, unit: TimeUnit) -> Self {
        Self { value, unit }
    }

    /// Total length in milliseconds
    pub fn millis(&self) -> i64 {
        self.value.saturating_mul(self.unit.millis())
    }

    /// Convert to a std duration (negative values clamp to zero)
    pub fn to_std(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.millis().max(0) as u64)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.unit)
    }
}

/// Value type of a backend column, decided once per column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Integer,
    Double,
    Text,
}

impl ValueType {
    pub fn is_numeric(&self) -> bool {
        !matches!(self, ValueType::Text)
    }
}

/// A decoded sample value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataValue {
    Integer(i64),
    Double(f64),
    Text(String),
}

impl DataValue {
    /// Numeric view of the value; text yields None
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DataValue::Integer(v) => Some(*v as f64),
            DataValue::Double(v) => Some(*v),
            DataValue::Text(_) => None,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, DataValue::Text(_))
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            DataValue::Integer(_) => ValueType::Integer,
            DataValue::Double(_) => ValueType::Double,
            DataValue::Text(_) => ValueType::Text,
        }
    }
}

impl fmt::Display for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataValue::Integer(v) => write!(f, "{}", v),
            DataValue::Double(v) => write!(f, "{}", v),
            DataValue::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for DataValue {
    fn from(v: i64) -> Self {
        DataValue::Integer(v)
    }
}

impl From<f64> for DataValue {
    fn from(v: f64) -> Self {
        DataValue::Double(v)
    }
}

impl From<&str> for DataValue {
    fn from(v: &str) -> Self {
        DataValue::Text(v.to_string())
    }
}

impl From<String> for DataValue {
    fn from(v: String) -> Self {
        DataValue::Text(v)
    }
}
