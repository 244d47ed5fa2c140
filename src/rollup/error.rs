//! Rollup error types

use thiserror::Error;

/// Errors raised by the rollup scheduler and its sinks
#[derive(Error, Debug)]
pub enum RollupError {
    /// The task definition is not valid JSON or misses required fields
    #[error("Malformed rollup task: {0}")]
    Parse(String),

    /// The task definition parsed but cannot be scheduled
    #[error("Invalid rollup task: {0}")]
    Invalid(String),

    /// Registration would exceed the configured task cap
    #[error("Rollup limit of {0} tasks reached")]
    LimitReached(usize),

    /// The scheduler no longer accepts tasks
    #[error("Rollup scheduler is shut down")]
    ShutDown,

    /// A sink could not store a run's result
    #[error("Rollup sink failed: {0}")]
    Sink(String),
}

impl From<serde_json::Error> for RollupError {
    fn from(err: serde_json::Error) -> Self {
        RollupError::Parse(err.to_string())
    }
}

/// Result type for rollup operations
pub type RollupResult<T> = Result<T, RollupError>;
