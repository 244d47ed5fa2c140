//! Outbound result model
//!
//! ```json
//! {"queries": [{"sample_size": 2,
//!               "results": [{"name": "cpu.usage",
//!                            "group_by": [{"name": "type", "type": "number"}],
//!                            "tags": {"host": ["a"]},
//!                            "values": [[1000, 1.5], [2000, 2.5]]}]}]}
//! ```

use crate::types::{DataValue, ValueType};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// One sample, serialized as `[timestamp, value]`
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDataPoint {
    pub timestamp: i64,
    pub value: DataValue,
}

impl QueryDataPoint {
    pub fn new(timestamp: i64, value: impl Into<DataValue>) -> Self {
        Self {
            timestamp,
            value: value.into(),
        }
    }
}

impl Serialize for QueryDataPoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.timestamp, &self.value).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for QueryDataPoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (timestamp, value) = <(i64, DataValue)>::deserialize(deserializer)?;
        Ok(Self { timestamp, value })
    }
}

/// Group descriptor attached to a result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum GroupByResult {
    /// Observed value type: `number` or `text`
    Type {
        #[serde(rename = "type")]
        group_type: String,
    },
    /// Tag grouping and the tag values of this group
    Tag {
        tags: Vec<String>,
        group: BTreeMap<String, String>,
    },
    /// Value-range bucket
    Value {
        range_size: f64,
        group: ValueGroup,
    },
}

impl GroupByResult {
    pub fn for_type(value_type: ValueType) -> Self {
        GroupByResult::Type {
            group_type: if value_type.is_numeric() {
                "number".to_string()
            } else {
                "text".to_string()
            },
        }
    }
}

/// Bucket index of a value group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueGroup {
    pub group_number: i64,
}

/// One series of a metric result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValueResult {
    pub name: String,

    #[serde(default)]
    pub group_by: Vec<GroupByResult>,

    /// Tag key → distinct values observed in this series
    #[serde(default)]
    pub tags: BTreeMap<String, Vec<String>>,

    #[serde(default)]
    pub values: Vec<QueryDataPoint>,
}

impl MetricValueResult {
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group_by: Vec::new(),
            tags: BTreeMap::new(),
            values: Vec::new(),
        }
    }

    /// Whether every value is text
    pub fn is_text(&self) -> bool {
        !self.values.is_empty() && self.values.iter().all(|p| p.value.is_text())
    }
}

/// Result of one metric query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricResult {
    /// Raw samples read before aggregation
    pub sample_size: u64,

    pub results: Vec<MetricValueResult>,

    /// Partial-failure notes (unreachable shards and the like)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl MetricResult {
    /// Result for a metric with no matching data
    pub fn void(name: impl Into<String>) -> Self {
        Self {
            sample_size: 0,
            results: vec![MetricValueResult::empty(name)],
            warnings: Vec::new(),
        }
    }

    pub fn is_void(&self) -> bool {
        self.sample_size == 0 && self.results.iter().all(|r| r.values.is_empty())
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings.extend(warnings);
        self
    }
}

/// Results of every metric in a query, in request order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub queries: Vec<MetricResult>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_data_point_is_a_pair() {
        let point = QueryDataPoint::new(1000, 1.5);
        assert_eq!(serde_json::to_value(&point).unwrap(), json!([1000, 1.5]));

        let back: QueryDataPoint = serde_json::from_value(json!([2000, "up"])).unwrap();
        assert_eq!(back.value, DataValue::Text("up".into()));
    }

    #[test]
    fn test_void_result_shape() {
        let result = MetricResult::void("missing");
        assert!(result.is_void());
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({
                "sample_size": 0,
                "results": [{"name": "missing", "group_by": [], "tags": {}, "values": []}]
            })
        );
    }

    #[test]
    fn test_group_by_descriptors() {
        assert_eq!(
            serde_json::to_value(GroupByResult::for_type(ValueType::Double)).unwrap(),
            json!({"name": "type", "type": "number"})
        );

        let tag = GroupByResult::Tag {
            tags: vec!["host".into()],
            group: [("host".to_string(), "a".to_string())].into_iter().collect(),
        };
        assert_eq!(
            serde_json::to_value(tag).unwrap(),
            json!({"name": "tag", "tags": ["host"], "group": {"host": "a"}})
        );
    }
}
