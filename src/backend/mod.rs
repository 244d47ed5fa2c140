//! Backend Statement Interface
//!
//! Abstraction over a path-addressed time-series engine:
//!
//! - **Backend**: opens connections to a target (one engine instance)
//! - **Connection**: runs a select (pull-based `RowCursor`) or a batch of
//!   non-query statements
//! - **pool**: bounded per-target connection pools with RAII leases
//! - **http**: REST adapter for a remote engine
//! - **memory**: in-process engine that understands the emitted dialect
//!
//! Result sets are column-per-series: every column is named by its full
//! encoded path and carries the backend's declared data type.

mod error;
pub mod http;
pub mod memory;
pub mod pool;
mod statement;

pub use error::{BackendError, BackendResult};
pub use http::HttpBackend;
pub use memory::MemoryBackend;
pub use pool::{ConnectionPool, PoolMetrics, PoolMetricsSnapshot, PoolSettings, PooledConnection};

use crate::types::ValueType;
use async_trait::async_trait;
use std::fmt;

/// Data type declared by the backend for a result column
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendType {
    Int32,
    Int64,
    Float,
    Double,
    Text,
    Boolean,
    Unknown(String),
}

impl BackendType {
    /// Parse a backend type name (case-insensitive)
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_uppercase().as_str() {
            "INT32" | "INTEGER" => BackendType::Int32,
            "INT64" | "BIGINT" | "LONG" => BackendType::Int64,
            "FLOAT" => BackendType::Float,
            "DOUBLE" => BackendType::Double,
            "TEXT" | "VARCHAR" | "STRING" => BackendType::Text,
            "BOOLEAN" => BackendType::Boolean,
            _ => BackendType::Unknown(name.to_string()),
        }
    }

    /// Value type this column decodes to, or None if it cannot be served
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            BackendType::Int32 | BackendType::Int64 => Some(ValueType::Integer),
            BackendType::Float | BackendType::Double => Some(ValueType::Double),
            BackendType::Text => Some(ValueType::Text),
            BackendType::Boolean | BackendType::Unknown(_) => None,
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendType::Int32 => write!(f, "INT32"),
            BackendType::Int64 => write!(f, "INT64"),
            BackendType::Float => write!(f, "FLOAT"),
            BackendType::Double => write!(f, "DOUBLE"),
            BackendType::Text => write!(f, "TEXT"),
            BackendType::Boolean => write!(f, "BOOLEAN"),
            BackendType::Unknown(name) => write!(f, "{}", name),
        }
    }
}

/// Name and declared type of one result column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    pub data_type: BackendType,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, data_type: BackendType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// A raw field as returned by the backend
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Integer(i64),
    Double(f64),
    Text(String),
    Boolean(bool),
}

/// One result row: a timestamp and one optional field per column
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub timestamp: i64,
    pub values: Vec<Option<FieldValue>>,
}

/// Pull-based iterator over a select result
#[async_trait]
pub trait RowCursor: Send {
    /// Column metadata, in field order
    fn columns(&self) -> &[ColumnMeta];

    /// Next row, or None when exhausted
    async fn next_row(&mut self) -> BackendResult<Option<Row>>;
}

/// An open session with one backend instance
#[async_trait]
pub trait Connection: Send {
    /// Target this connection was opened against
    fn target(&self) -> &str;

    /// Run a select statement
    async fn query(&mut self, sql: &str) -> BackendResult<Box<dyn RowCursor>>;

    /// Run non-query statements as one batch
    async fn execute_batch(&mut self, statements: &[String]) -> BackendResult<()>;

    /// Check the connection is still usable
    async fn ping(&mut self) -> BackendResult<()>;
}

/// Factory for connections to backend instances
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    async fn connect(&self, target: &str) -> BackendResult<Box<dyn Connection>>;
}

/// Cursor over rows that are already in memory
pub struct VecCursor {
    columns: Vec<ColumnMeta>,
    rows: std::vec::IntoIter<Row>,
}

impl VecCursor {
    pub fn new(columns: Vec<ColumnMeta>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows: rows.into_iter(),
        }
    }
}

#[async_trait]
impl RowCursor for VecCursor {
    fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    async fn next_row(&mut self) -> BackendResult<Option<Row>> {
        Ok(self.rows.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_type_names() {
        assert_eq!(BackendType::from_name("INT64"), BackendType::Int64);
        assert_eq!(BackendType::from_name("bigint"), BackendType::Int64);
        assert_eq!(BackendType::from_name("INTEGER"), BackendType::Int32);
        assert_eq!(BackendType::from_name("VARCHAR"), BackendType::Text);
        assert_eq!(
            BackendType::from_name("VECTOR"),
            BackendType::Unknown("VECTOR".into())
        );
    }

    #[test]
    fn test_value_type_mapping() {
        assert_eq!(BackendType::Int32.value_type(), Some(ValueType::Integer));
        assert_eq!(BackendType::Float.value_type(), Some(ValueType::Double));
        assert_eq!(BackendType::Text.value_type(), Some(ValueType::Text));
        assert_eq!(BackendType::Boolean.value_type(), None);
    }

    #[tokio::test]
    async fn test_vec_cursor() {
        let mut cursor = VecCursor::new(
            vec![ColumnMeta::new("root.g.m", BackendType::Int64)],
            vec![Row {
                timestamp: 1,
                values: vec![Some(FieldValue::Integer(7))],
            }],
        );
        assert_eq!(cursor.columns().len(), 1);
        assert_eq!(cursor.next_row().await.unwrap().unwrap().timestamp, 1);
        assert!(cursor.next_row().await.unwrap().is_none());
    }
}
