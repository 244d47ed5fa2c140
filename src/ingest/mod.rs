//! Ingest
//!
//! The write side of the gateway. A tagged point is turned into a path the
//! same way queries are compiled, so both sides agree on addressing:
//!
//! 1. Tag keys are assigned slots in sorted key order (first write wins).
//! 2. Each slot holds the point's value for that tag, or `_` when absent.
//! 3. The insert goes to every write target of the metric: the epoch's
//!    primaries for the timestamp, or the protocol machines when a protocol
//!    table is configured.
//!
//! Batches are grouped per instance; an instance that fails drops its whole
//! batch while the others still apply theirs.

mod error;

pub use error::{IngestError, IngestResult};

use crate::query::result::MetricResult;
use crate::router::Router;
use crate::schema::TagSchemaRegistry;
use crate::sql::path::{storage_group, SeriesPath, PLACEHOLDER};
use crate::sql::InsertStatement;
use crate::types::DataValue;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One tagged sample to write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    #[serde(rename = "name")]
    pub metric: String,
    pub timestamp: i64,
    pub value: DataValue,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl DataPoint {
    pub fn new(metric: impl Into<String>, timestamp: i64, value: impl Into<DataValue>) -> Self {
        Self {
            metric: metric.into(),
            timestamp,
            value: value.into(),
            tags: BTreeMap::new(),
        }
    }

    /// Add a tag to the point
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Check the point can be encoded as a path and a value literal
    pub fn validate(&self) -> IngestResult<()> {
        if self.metric.is_empty() {
            return Err(IngestError::InvalidPoint(
                "metric name cannot be empty".to_string(),
            ));
        }
        for (key, value) in &self.tags {
            if key.is_empty() || value.is_empty() {
                return Err(IngestError::InvalidPoint(format!(
                    "empty tag key or value in {}={}",
                    key, value
                )));
            }
            if value == PLACEHOLDER {
                return Err(IngestError::InvalidPoint(format!(
                    "tag {} uses the reserved value {}",
                    key, PLACEHOLDER
                )));
            }
        }
        if let DataValue::Double(v) = self.value {
            if !v.is_finite() {
                return Err(IngestError::InvalidPoint(format!(
                    "value {} is not a finite number",
                    v
                )));
            }
        }
        Ok(())
    }
}

/// A point that was not written, by batch index
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedPoint {
    pub index: usize,
    pub error: String,
}

/// Outcome of a batch write
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestSummary {
    /// Points that produced a statement
    pub accepted: usize,
    pub rejected: Vec<RejectedPoint>,
    /// Instances whose batch failed
    pub failed_targets: Vec<String>,
}

impl IngestSummary {
    pub fn is_complete(&self) -> bool {
        self.rejected.is_empty() && self.failed_targets.is_empty()
    }
}

/// Writes tagged points through the registry and the router
#[derive(Debug, Clone)]
pub struct Ingestor {
    registry: Arc<TagSchemaRegistry>,
    router: Arc<Router>,
    storage_group_count: u32,
}

impl Ingestor {
    pub fn new(registry: Arc<TagSchemaRegistry>, router: Arc<Router>, storage_group_count: u32) -> Self {
        Self {
            registry,
            router,
            storage_group_count,
        }
    }

    /// Series path a point is stored under, assigning slots as needed
    pub fn path_for(&self, point: &DataPoint) -> IngestResult<SeriesPath> {
        point.validate()?;
        let positions = self
            .registry
            .assign_all(&point.metric, point.tags.keys().map(String::as_str))?;

        let slots = positions
            .keys()
            .iter()
            .map(|key| {
                point
                    .tags
                    .get(key)
                    .cloned()
                    .unwrap_or_else(|| PLACEHOLDER.to_string())
            })
            .collect();

        Ok(SeriesPath::new(
            storage_group(&point.metric, self.storage_group_count),
            slots,
            point.metric.clone(),
        ))
    }

    fn prepare(&self, point: &DataPoint) -> IngestResult<(String, Vec<String>)> {
        let path = self.path_for(point)?;
        let targets = self.router.write_targets(&point.metric, point.timestamp);
        if targets.is_empty() {
            return Err(IngestError::NoTargets(point.metric.clone()));
        }
        let statement = InsertStatement::new(path, point.timestamp, point.value.clone());
        Ok((statement.to_sql(), targets))
    }

    /// Write one point to all of its targets
    ///
    /// Succeeds when at least one target accepted it.
    pub async fn write(&self, point: &DataPoint) -> IngestResult<()> {
        let (sql, targets) = self.prepare(point)?;
        let outcome = self.router.broadcast(&targets, &[sql]).await;

        if outcome.succeeded.is_empty() {
            let message = outcome
                .failed
                .first()
                .map(|(_, e)| e.to_string())
                .unwrap_or_default();
            return Err(IngestError::WriteFailed {
                metric: point.metric.clone(),
                failed: outcome.failed.len(),
                message,
            });
        }
        Ok(())
    }

    /// Write a batch, one backend batch per target instance
    pub async fn write_batch(&self, points: &[DataPoint]) -> IngestSummary {
        let mut summary = IngestSummary::default();
        let mut per_target: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for (index, point) in points.iter().enumerate() {
            match self.prepare(point) {
                Ok((sql, targets)) => {
                    summary.accepted += 1;
                    for target in targets {
                        per_target.entry(target).or_default().push(sql.clone());
                    }
                }
                Err(e) => {
                    tracing::warn!(index, metric = %point.metric, error = %e, "Rejected point");
                    summary.rejected.push(RejectedPoint {
                        index,
                        error: e.to_string(),
                    });
                }
            }
        }

        let results = join_all(per_target.iter().map(|(target, statements)| async move {
            (target, self.router.execute_on(target, statements).await)
        }))
        .await;

        for (target, result) in results {
            if let Err(e) = result {
                tracing::error!(
                    instance = %target,
                    statements = per_target[target].len(),
                    error = %e,
                    "Write batch abandoned"
                );
                summary.failed_targets.push(target.clone());
            }
        }

        tracing::debug!(
            accepted = summary.accepted,
            rejected = summary.rejected.len(),
            instances = per_target.len(),
            "Batch written"
        );
        summary
    }

    /// Write every series of a query result under `metric`
    ///
    /// Tags that took a single value in a series are carried over; tags with
    /// several values cannot be addressed and are dropped.
    pub async fn write_result(&self, metric: &str, result: &MetricResult) -> IngestSummary {
        let points: Vec<DataPoint> = result
            .results
            .iter()
            .flat_map(|series| {
                let tags: BTreeMap<String, String> = series
                    .tags
                    .iter()
                    .filter_map(|(key, values)| match values.as_slice() {
                        [only] => Some((key.clone(), only.clone())),
                        _ => None,
                    })
                    .collect();
                series.values.iter().map(move |p| DataPoint {
                    metric: metric.to_string(),
                    timestamp: p.timestamp,
                    value: p.value.clone(),
                    tags: tags.clone(),
                })
            })
            .collect();

        self.write_batch(&points).await
    }
}
