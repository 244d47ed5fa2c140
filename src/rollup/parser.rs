//! Rollup task definitions
//!
//! ```json
//! { "name": "cpu-hourly",
//!   "execution_interval": {"value": 1, "unit": "hours"},
//!   "save_as": "cpu.usage.hourly",
//!   "query": { "start_relative": {"value": 1, "unit": "hours"},
//!              "metrics": [{"name": "cpu.usage", "aggregators": [{"name": "avg"}]}] } }
//! ```
//!
//! The embedded query is the inbound query model; relative windows move with
//! each run. `execution_interval` falls back to the configured default.

use super::error::{RollupError, RollupResult};
use crate::query::QueryRequest;
use crate::types::Duration;
use serde::{Deserialize, Serialize};

/// A submitted rollup task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupDefinition {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_interval: Option<Duration>,

    /// Metric name the results are written under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_as: Option<String>,

    pub query: QueryRequest,
}

/// Parse and check a task definition
pub fn parse_definition(json: &str) -> RollupResult<RollupDefinition> {
    let definition: RollupDefinition = serde_json::from_str(json)?;
    definition.validate()?;
    Ok(definition)
}

impl RollupDefinition {
    pub fn validate(&self) -> RollupResult<()> {
        if self.name.trim().is_empty() {
            return Err(RollupError::Invalid("name must not be empty".to_string()));
        }
        if let Some(interval) = self.execution_interval {
            if interval.millis() <= 0 {
                return Err(RollupError::Invalid(format!(
                    "execution_interval must be positive, got {}",
                    interval
                )));
            }
        }
        if let Some(save_as) = &self.save_as {
            if save_as.trim().is_empty() {
                return Err(RollupError::Invalid("save_as must not be empty".to_string()));
            }
        }
        self.query
            .validate()
            .map_err(|e| RollupError::Parse(format!("embedded query: {}", e)))
    }
}
