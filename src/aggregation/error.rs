//! Aggregation error types

use thiserror::Error;

/// Errors raised while building an aggregation pipeline
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AggregationError {
    /// An aggregator parameter is out of range
    #[error("Invalid parameter for {aggregator}: {message}")]
    InvalidParameter {
        aggregator: &'static str,
        message: String,
    },

    /// A group-by definition cannot be applied
    #[error("Invalid group_by {group_by}: {message}")]
    InvalidGroupBy {
        group_by: &'static str,
        message: String,
    },
}

impl AggregationError {
    pub(crate) fn parameter(aggregator: &'static str, message: impl Into<String>) -> Self {
        AggregationError::InvalidParameter {
            aggregator,
            message: message.into(),
        }
    }
}

/// Result type for aggregation operations
pub type AggregationResult<T> = Result<T, AggregationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AggregationError::parameter("div", "divisor must not be zero");
        assert_eq!(
            err.to_string(),
            "Invalid parameter for div: divisor must not be zero"
        );
    }
}
