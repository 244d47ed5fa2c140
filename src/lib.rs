//! # tagbridge
//!
//! Tag-based time-series queries over a path-addressed storage engine.
//!
//! Clients speak a KairosDB-shaped model: a metric name, a set of tag
//! filters, a time window and an aggregation chain. The backend only knows
//! hierarchical series paths (`root.<group>.<slot…>.<metric>`) and a SQL-like
//! statement dialect. tagbridge translates between the two.
//!
//! ## Features
//!
//! - **Tag schema**: stable per-metric tag → slot positions, persisted
//! - **Compilation**: tag filters + time ranges → multi-path selects
//! - **Routing**: time-partitioned epochs with fail-over and pooled connections
//! - **Reassembly**: path-labelled columns back into tagged series
//! - **Aggregation**: range, transform and group-by stages, applied in order
//! - **Rollups**: stored queries re-run on a schedule
//!
//! ## Modules
//!
//! - [`schema`]: tag-schema registry
//! - [`sql`]: path/SQL compiler
//! - [`router`]: shard router over per-instance connection pools
//! - [`backend`]: statement-engine interface, HTTP client and in-memory engine
//! - [`query`]: query model, reassembler and executor
//! - [`aggregation`]: aggregators and group-by
//! - [`ingest`]: tagged point writes
//! - [`rollup`]: rollup scheduler
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tagbridge::backend::{MemoryBackend, PoolSettings};
//! use tagbridge::ingest::{DataPoint, Ingestor};
//! use tagbridge::query::{MetricQuery, QueryExecutor, QueryRequest};
//! use tagbridge::router::{Router, RoutingTable};
//! use tagbridge::schema::TagSchemaRegistry;
//! use tagbridge::types::TimeRange;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Arc::new(TagSchemaRegistry::new(50));
//!     let router = Arc::new(Router::new(
//!         RoutingTable::single(vec!["127.0.0.1:6667".to_string()]),
//!         Arc::new(MemoryBackend::new()),
//!         PoolSettings::default(),
//!     ));
//!
//!     // Write a tagged point
//!     let ingestor = Ingestor::new(Arc::clone(&registry), Arc::clone(&router), 50);
//!     ingestor
//!         .write(&DataPoint::new("cpu.usage", 1000, 42.0).tag("host", "a"))
//!         .await?;
//!
//!     // Read it back by tag
//!     let executor = QueryExecutor::new(registry, router);
//!     let response = executor
//!         .execute(&QueryRequest::absolute(
//!             TimeRange::new(0, 2000),
//!             vec![MetricQuery::new("cpu.usage").tag("host", "a")],
//!         ))
//!         .await?;
//!
//!     println!("Found {} samples", response.queries[0].sample_size);
//!     Ok(())
//! }
//! ```

pub mod aggregation;
pub mod backend;
pub mod config;
pub mod ingest;
pub mod query;
pub mod rollup;
pub mod router;
pub mod schema;
pub mod sql;
pub mod types;

// Re-export top-level types for convenience
pub use types::{now_millis, DataValue, Duration, TimeRange, TimeUnit, ValueType};

pub use schema::{SchemaError, SchemaResult, TagPositions, TagSchemaRegistry};

pub use sql::{CompiledQuery, DeleteBatchBuilder, SelectStatement, SeriesPath, TagFilters};

pub use backend::{
    Backend, BackendError, BackendResult, ConnectionPool, HttpBackend, MemoryBackend,
    PoolSettings,
};

pub use router::{Router, RoutingTable};

pub use query::{
    DeleteSummary, MetricQuery, MetricResult, QueryError, QueryExecutor, QueryRequest,
    QueryResponse, QueryResult,
};

pub use aggregation::{AggregationError, AggregationResult, AggregatorSpec, GroupBySpec, Pipeline};

pub use ingest::{DataPoint, IngestError, IngestResult, IngestSummary, Ingestor};

pub use rollup::{RollupDefinition, RollupError, RollupResult, RollupScheduler, RollupTask};

pub use config::{Config, ConfigError, LoggingConfig, SharedConfig};
