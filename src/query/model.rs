//! Inbound query model
//!
//! KairosDB-shaped JSON:
//!
//! ```json
//! { "start_absolute": 1000, "end_relative": {"value": 5, "unit": "minutes"},
//!   "metrics": [ { "name": "cpu.usage", "tags": {"host": ["a", "b"]},
//!                  "group_by": [...], "aggregators": [...] } ] }
//! ```
//!
//! Exactly one of `start_absolute` / `start_relative` must be present; the end
//! defaults to now. Relative times are resolved against the moment the query
//! runs, so a stored query (such as a rollup's) moves with the clock.

use crate::aggregation::{AggregatorSpec, GroupBySpec};
use crate::query::error::{QueryError, QueryResult};
use crate::sql::TagFilters;
use crate::types::{Duration, TimeRange};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// A query over one or more metrics sharing a time window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_absolute: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_relative: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_absolute: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_relative: Option<Duration>,

    pub metrics: Vec<MetricQuery>,
}

impl QueryRequest {
    /// Parse a JSON query document
    pub fn from_json(json: &str) -> QueryResult<Self> {
        let request: QueryRequest = serde_json::from_str(json)?;
        request.validate()?;
        Ok(request)
    }

    /// An absolute-window query
    pub fn absolute(range: TimeRange, metrics: Vec<MetricQuery>) -> Self {
        Self {
            start_absolute: Some(range.start),
            start_relative: None,
            end_absolute: Some(range.end),
            end_relative: None,
            metrics,
        }
    }

    /// Check the parts that do not depend on the clock
    pub fn validate(&self) -> QueryResult<()> {
        match (self.start_absolute, self.start_relative) {
            (Some(_), Some(_)) => {
                return Err(QueryError::InvalidTimeRange(
                    "start_absolute and start_relative are mutually exclusive".to_string(),
                ))
            }
            (None, None) => {
                return Err(QueryError::InvalidTimeRange(
                    "one of start_absolute or start_relative is required".to_string(),
                ))
            }
            _ => {}
        }

        if self.end_absolute.is_some() && self.end_relative.is_some() {
            return Err(QueryError::InvalidTimeRange(
                "end_absolute and end_relative are mutually exclusive".to_string(),
            ));
        }

        if self.metrics.is_empty() {
            return Err(QueryError::InvalidQuery(
                "at least one metric is required".to_string(),
            ));
        }

        if let Some(metric) = self.metrics.iter().find(|m| m.name.is_empty()) {
            return Err(QueryError::InvalidQuery(format!(
                "metric name must not be empty (tags: {:?})",
                metric.tags
            )));
        }

        Ok(())
    }

    /// Resolve the query window against `now` (epoch ms)
    pub fn time_range(&self, now: i64) -> QueryResult<TimeRange> {
        self.validate()?;

        let start = match (self.start_absolute, self.start_relative) {
            (Some(start), _) => start,
            (None, Some(relative)) => now.saturating_sub(relative.millis()),
            (None, None) => {
                return Err(QueryError::InvalidTimeRange(
                    "query has no start time".to_string(),
                ))
            }
        };

        let end = match (self.end_absolute, self.end_relative) {
            (Some(end), _) => end,
            (None, Some(relative)) => now.saturating_sub(relative.millis()),
            (None, None) => now,
        };

        TimeRange::try_new(start, end).ok_or_else(|| {
            QueryError::InvalidTimeRange(format!("start {} is after end {}", start, end))
        })
    }
}

/// One metric's part of a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricQuery {
    pub name: String,

    /// Tag key → accepted values; a single string is accepted for one value
    #[serde(default, deserialize_with = "deserialize_tags")]
    pub tags: TagFilters,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<GroupBySpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregators: Vec<AggregatorSpec>,
}

impl MetricQuery {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: TagFilters::new(),
            group_by: Vec::new(),
            aggregators: Vec::new(),
        }
    }

    /// Add an accepted value for a tag key
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.entry(key.into()).or_default().push(value.into());
        self
    }

    pub fn group_by(mut self, spec: GroupBySpec) -> Self {
        self.group_by.push(spec);
        self
    }

    pub fn aggregator(mut self, spec: AggregatorSpec) -> Self {
        self.aggregators.push(spec);
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn deserialize_tags<'de, D>(deserializer: D) -> Result<TagFilters, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: BTreeMap<String, OneOrMany> = BTreeMap::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(key, values)| {
            let values = match values {
                OneOrMany::One(v) => vec![v],
                OneOrMany::Many(vs) => vs,
            };
            (key, values)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TimeUnit;

    #[test]
    fn test_parse_absolute_query() {
        let request = QueryRequest::from_json(
            r#"{
                "start_absolute": 1000,
                "end_absolute": 5000,
                "metrics": [{"name": "cpu.usage", "tags": {"host": ["a"], "dc": "eu"}}]
            }"#,
        )
        .unwrap();

        assert_eq!(request.time_range(0).unwrap(), TimeRange::new(1000, 5000));
        let metric = &request.metrics[0];
        assert_eq!(metric.tags["host"], vec!["a"]);
        assert_eq!(metric.tags["dc"], vec!["eu"]);
    }

    #[test]
    fn test_relative_window() {
        let request = QueryRequest::from_json(
            r#"{"start_relative": {"value": 1, "unit": "hours"}, "metrics": [{"name": "m"}]}"#,
        )
        .unwrap();

        let now = 10_000_000;
        assert_eq!(
            request.time_range(now).unwrap(),
            TimeRange::new(now - 3_600_000, now)
        );
        assert_eq!(request.start_relative, Some(Duration::new(1, TimeUnit::Hours)));
    }

    #[test]
    fn test_start_after_end_rejected() {
        let request = QueryRequest::from_json(
            r#"{"start_absolute": 5000, "end_absolute": 1000, "metrics": [{"name": "m"}]}"#,
        )
        .unwrap();
        assert!(matches!(
            request.time_range(0),
            Err(QueryError::InvalidTimeRange(_))
        ));
    }

    #[test]
    fn test_start_is_required() {
        let err = QueryRequest::from_json(r#"{"metrics": [{"name": "m"}]}"#).unwrap_err();
        assert!(matches!(err, QueryError::InvalidTimeRange(_)));

        let err = QueryRequest::from_json(r#"{"start_absolute": 1, "metrics": []}"#).unwrap_err();
        assert!(matches!(err, QueryError::InvalidQuery(_)));
    }

    #[test]
    fn test_builder() {
        let metric = MetricQuery::new("m").tag("host", "a").tag("host", "b");
        assert_eq!(metric.tags["host"], vec!["a", "b"]);
    }
}
