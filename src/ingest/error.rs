//! Ingest error types

use crate::schema::SchemaError;
use thiserror::Error;

/// Errors that can occur while writing points
#[derive(Error, Debug)]
pub enum IngestError {
    /// The point cannot be addressed or encoded
    #[error("Invalid point: {0}")]
    InvalidPoint(String),

    /// Tag slot assignment failed, including the per-metric cap
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// The routing table names no instance for the point
    #[error("No write target for metric {0}")]
    NoTargets(String),

    /// Every target instance rejected the write
    #[error("Write of {metric} failed on {failed} instance(s): {message}")]
    WriteFailed {
        metric: String,
        failed: usize,
        message: String,
    },
}

/// Result type for ingest operations
pub type IngestResult<T> = Result<T, IngestError>;
