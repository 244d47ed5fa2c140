//! Tag Schema
//!
//! Maps each metric's dynamic tag keys onto fixed path slots:
//!
//! ```text
//! cpu.usage {host=a, region=us}
//!        ↓  registry: host → 0, region → 1
//! root.group_7.a.us.`cpu.usage`
//! ```
//!
//! Slots are handed out first-come, never reused, and capped per metric.

mod error;
mod registry;

pub use error::{SchemaError, SchemaResult};
pub use registry::{TagPositions, TagSchemaRegistry};
