//! Tag Query Engine
//!
//! Serves KairosDB-shaped tag queries from a path-addressed backend:
//!
//! - **Model**: inbound query documents (`QueryRequest`, `MetricQuery`)
//! - **Result**: outbound per-metric results (`QueryResponse`, `MetricResult`)
//! - **Reassembler**: select result columns back into tagged series
//! - **Executor**: the end-to-end query and delete paths
//!
//! # Example
//!
//! ```rust,ignore
//! use tagbridge::query::{MetricQuery, QueryExecutor, QueryRequest};
//! use tagbridge::types::TimeRange;
//!
//! let request = QueryRequest::absolute(
//!     TimeRange::new(1000, 5000),
//!     vec![MetricQuery::new("cpu.usage").tag("host", "a")],
//! );
//! let response = executor.execute(&request).await?;
//! ```

mod error;
mod executor;
mod model;
pub mod reassembler;
pub mod result;

pub use error::{QueryError, QueryResult};
pub use executor::{DeleteSummary, QueryExecutor};
pub use model::{MetricQuery, QueryRequest};
pub use result::{
    GroupByResult, MetricResult, MetricValueResult, QueryDataPoint, QueryResponse, ValueGroup,
};
