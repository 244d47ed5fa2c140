//! Query error types
//!
//! Defines the error conditions that fail a query as a whole. Unknown
//! metrics, unresolvable tags and individual shard failures are not errors:
//! they produce void results or warnings instead.

use thiserror::Error;

/// Errors that can occur during query operations
#[derive(Error, Debug)]
pub enum QueryError {
    /// Query document could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Invalid time range specified
    #[error("Invalid time range: {0}")]
    InvalidTimeRange(String),

    /// Query is structurally invalid
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Aggregator or group-by definition was rejected
    #[error("Aggregation error: {0}")]
    Aggregation(#[from] crate::aggregation::AggregationError),

    /// Backend failure that could not be isolated to one shard
    #[error("Backend error: {0}")]
    Backend(#[from] crate::backend::BackendError),
}

impl From<serde_json::Error> for QueryError {
    fn from(err: serde_json::Error) -> Self {
        QueryError::Parse(err.to_string())
    }
}

/// Result type for query operations
pub type QueryResult<T> = Result<T, QueryError>;
