//! Path/SQL Compiler
//!
//! Purely syntactic translation from tag-addressed requests to the backend's
//! path-addressed statement dialect:
//!
//! - **path**: segment encoding and path patterns
//! - **select**: tag filters + time range → multi-path select
//! - **delete**: reassembled (path, timestamp) pairs → tombstone batch
//! - **insert**: single-point writes
//!
//! No I/O happens here; the tag mapping must already be resolved.

pub mod delete;
pub mod insert;
pub mod path;
pub mod select;

pub use delete::DeleteBatchBuilder;
pub use insert::{value_literal, InsertStatement};
pub use path::{PathExpression, PathSegment, SeriesPath};
pub use select::{CompiledQuery, SelectStatement, TagFilters};

/// Text value marking a deleted point
pub const NULL_SENTINEL: &str = "NULL";

/// Numeric value marking a deleted point (`2.147483646E9` when read as a double)
pub const MAGIC_SENTINEL: i64 = 2_147_483_646;
