//! Insert statements for the write path

use crate::sql::path::SeriesPath;
use crate::types::DataValue;
use std::fmt;

/// One point written to one series
#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    pub path: SeriesPath,
    pub timestamp: i64,
    pub value: DataValue,
}

impl InsertStatement {
    pub fn new(path: SeriesPath, timestamp: i64, value: DataValue) -> Self {
        Self {
            path,
            timestamp,
            value,
        }
    }

    pub fn to_sql(&self) -> String {
        format!(
            "INSERT INTO {}(timestamp, {}) VALUES({}, {})",
            self.path.device(),
            self.path.sensor(),
            self.timestamp,
            value_literal(&self.value)
        )
    }
}

impl fmt::Display for InsertStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_sql())
    }
}

/// Render a value so the backend infers the right column type
pub fn value_literal(value: &DataValue) -> String {
    match value {
        DataValue::Integer(v) => v.to_string(),
        // Debug keeps the fractional part ("1.0"), so doubles never read as integers
        DataValue::Double(v) => format!("{:?}", v),
        DataValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
    }
}
