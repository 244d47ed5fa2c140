//! Backend error types

use thiserror::Error;

/// Errors raised while talking to a backend instance
#[derive(Error, Debug)]
pub enum BackendError {
    /// Could not open a connection to a target
    #[error("Failed to connect to {target}: {message}")]
    Connect { target: String, message: String },

    /// Transport-level HTTP failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Backend answered with a non-success status
    #[error("Backend returned status {status}: {message}")]
    Status { status: u16, message: String },

    /// Backend rejected a statement
    #[error("Statement failed: {message} (sql: {sql})")]
    Statement { sql: String, message: String },

    /// Response did not have the expected shape
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No connection became available in time
    #[error("Timed out after {timeout_ms}ms waiting for a connection to {target}")]
    PoolTimeout { target: String, timeout_ms: u64 },

    /// Pool has been shut down
    #[error("Connection pool for {0} is closed")]
    PoolClosed(String),

    /// Target is not part of the routing table
    #[error("No instances configured for {0}")]
    NoTargets(String),
}

impl BackendError {
    /// Whether the connection that produced this error should be discarded
    pub fn is_connection_error(&self) -> bool {
        match self {
            BackendError::Connect { .. } => true,
            BackendError::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            BackendError::Protocol(_) => true,
            _ => false,
        }
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BackendError::PoolTimeout {
            target: "http://a:18080".to_string(),
            timeout_ms: 500,
        };
        assert_eq!(
            err.to_string(),
            "Timed out after 500ms waiting for a connection to http://a:18080"
        );
    }

    #[test]
    fn test_connection_errors() {
        let err = BackendError::Connect {
            target: "a".into(),
            message: "refused".into(),
        };
        assert!(err.is_connection_error());

        let err = BackendError::Statement {
            sql: "SELECT x FROM root.*".into(),
            message: "bad".into(),
        };
        assert!(!err.is_connection_error());
    }
}
