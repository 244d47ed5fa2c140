//! Tag schema error types

use thiserror::Error;

/// Errors raised by the tag schema registry
#[derive(Error, Debug)]
pub enum SchemaError {
    /// A metric tried to register more tag keys than the slot cap allows
    #[error("Tag slot capacity exceeded for metric '{metric}': cannot add '{tag}', limit is {limit}")]
    CapacityExceeded {
        metric: String,
        tag: String,
        limit: usize,
    },

    /// Reading or writing the schema file failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The schema file could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for SchemaError {
    fn from(err: serde_json::Error) -> Self {
        SchemaError::Serialization(err.to_string())
    }
}

/// Result type alias for schema operations
pub type SchemaResult<T> = Result<T, SchemaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SchemaError::CapacityExceeded {
            metric: "cpu".to_string(),
            tag: "rack".to_string(),
            limit: 2,
        };
        assert_eq!(
            err.to_string(),
            "Tag slot capacity exceeded for metric 'cpu': cannot add 'rack', limit is 2"
        );
    }
}
