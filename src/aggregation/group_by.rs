//! Group-by materialization
//!
//! Turns the reassembled, tagged series of one metric into a `MetricResult`.
//! Every series lands in exactly one group per sample; groups are keyed by
//! value type first (always), then by each user group-by in order:
//!
//! - `tag`: the values of the listed tags (absent tags are left out)
//! - `value`: `floor(value / range_size)`, numeric samples only
//!
//! A group's samples are merged in timestamp order and its `tags` map holds
//! every distinct value each tag key took across the group's series.

use super::{AggregationResult, GroupBySpec};
use crate::query::reassembler::TaggedSeries;
use crate::query::result::{GroupByResult, MetricResult, MetricValueResult, QueryDataPoint, ValueGroup};
use crate::types::ValueType;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum KeyPart {
    Tags(BTreeMap<String, String>),
    Bucket(Option<i64>),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct GroupKey {
    text: bool,
    parts: Vec<KeyPart>,
}

#[derive(Default)]
struct Group {
    tags: BTreeMap<String, BTreeSet<String>>,
    points: Vec<QueryDataPoint>,
}

impl Group {
    fn add(&mut self, tags: &BTreeMap<String, String>, points: Vec<QueryDataPoint>) {
        for (key, value) in tags {
            self.tags.entry(key.clone()).or_default().insert(value.clone());
        }
        self.points.extend(points);
    }
}

/// Group a metric's series; the result is void when no series has samples
pub fn group(
    metric: &str,
    series: Vec<TaggedSeries>,
    specs: &[GroupBySpec],
) -> AggregationResult<MetricResult> {
    for spec in specs {
        spec.validate()?;
    }
    let specs: Vec<&GroupBySpec> = specs
        .iter()
        .filter(|s| !matches!(s, GroupBySpec::Type { .. }))
        .collect();

    let has_value_group = specs.iter().any(|s| matches!(s, GroupBySpec::Value { .. }));

    let mut groups: BTreeMap<GroupKey, Group> = BTreeMap::new();
    let mut sample_size = 0u64;

    for s in series.into_iter().filter(|s| !s.points.is_empty()) {
        sample_size += s.points.len() as u64;
        let text = s.value_type == ValueType::Text;

        let tag_parts: Vec<Option<KeyPart>> = specs
            .iter()
            .map(|spec| match spec {
                GroupBySpec::Tag { tags } => Some(KeyPart::Tags(
                    tags.iter()
                        .filter_map(|t| s.tags.get(t).map(|v| (t.clone(), v.clone())))
                        .collect(),
                )),
                _ => None,
            })
            .collect();

        if !has_value_group {
            let key = GroupKey {
                text,
                parts: tag_parts.into_iter().flatten().collect(),
            };
            groups.entry(key).or_default().add(&s.tags, s.points);
            continue;
        }

        let mut split: BTreeMap<GroupKey, Vec<QueryDataPoint>> = BTreeMap::new();
        for point in s.points {
            let parts = specs
                .iter()
                .zip(tag_parts.iter())
                .map(|(spec, tag_part)| match (spec, tag_part) {
                    (_, Some(part)) => part.clone(),
                    (GroupBySpec::Value { range_size }, None) => KeyPart::Bucket(
                        point.value.as_f64().map(|v| (v / range_size).floor() as i64),
                    ),
                    (_, None) => KeyPart::Bucket(None),
                })
                .collect();
            split.entry(GroupKey { text, parts }).or_default().push(point);
        }
        for (key, points) in split {
            groups.entry(key).or_default().add(&s.tags, points);
        }
    }

    if groups.is_empty() {
        return Ok(MetricResult::void(metric));
    }

    let results = groups
        .into_iter()
        .map(|(key, mut group)| {
            group.points.sort_by_key(|p| p.timestamp);

            let mut group_by: Vec<GroupByResult> = specs
                .iter()
                .zip(key.parts)
                .filter_map(|(spec, part)| match (spec, part) {
                    (GroupBySpec::Tag { tags }, KeyPart::Tags(group)) => Some(GroupByResult::Tag {
                        tags: tags.clone(),
                        group,
                    }),
                    (GroupBySpec::Value { range_size }, KeyPart::Bucket(Some(n))) => {
                        Some(GroupByResult::Value {
                            range_size: *range_size,
                            group: ValueGroup { group_number: n },
                        })
                    }
                    _ => None,
                })
                .collect();
            group_by.push(GroupByResult::for_type(if key.text {
                ValueType::Text
            } else {
                ValueType::Double
            }));

            MetricValueResult {
                name: metric.to_string(),
                group_by,
                tags: group
                    .tags
                    .into_iter()
                    .map(|(k, vs)| (k, vs.into_iter().collect()))
                    .collect(),
                values: group.points,
            }
        })
        .collect();

    Ok(MetricResult {
        sample_size,
        results,
        warnings: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(tags: &[(&str, &str)], value_type: ValueType, points: Vec<QueryDataPoint>) -> TaggedSeries {
        TaggedSeries {
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            value_type,
            points,
        }
    }

    #[test]
    fn test_type_grouping_always_applied() {
        let input = vec![
            series(
                &[("host", "a")],
                ValueType::Double,
                vec![QueryDataPoint::new(2000, 2.0)],
            ),
            series(
                &[("host", "b")],
                ValueType::Double,
                vec![QueryDataPoint::new(1000, 1.0)],
            ),
            series(
                &[("host", "c")],
                ValueType::Text,
                vec![QueryDataPoint::new(1500, "up")],
            ),
        ];

        let result = group("cpu", input, &[]).unwrap();
        assert_eq!(result.sample_size, 3);
        assert_eq!(result.results.len(), 2);

        let numbers = &result.results[0];
        assert_eq!(numbers.group_by, vec![GroupByResult::for_type(ValueType::Double)]);
        assert_eq!(numbers.tags["host"], vec!["a", "b"]);
        assert_eq!(
            numbers.values,
            vec![QueryDataPoint::new(1000, 1.0), QueryDataPoint::new(2000, 2.0)]
        );

        let text = &result.results[1];
        assert_eq!(text.group_by, vec![GroupByResult::for_type(ValueType::Text)]);
        assert_eq!(text.tags["host"], vec!["c"]);
    }

    #[test]
    fn test_tag_grouping() {
        let input = vec![
            series(
                &[("host", "a"), ("dc", "eu")],
                ValueType::Integer,
                vec![QueryDataPoint::new(1, 1i64)],
            ),
            series(
                &[("host", "b"), ("dc", "eu")],
                ValueType::Integer,
                vec![QueryDataPoint::new(2, 2i64)],
            ),
            series(
                &[("host", "a"), ("dc", "us")],
                ValueType::Integer,
                vec![QueryDataPoint::new(3, 3i64)],
            ),
        ];

        let result = group("m", input, &[GroupBySpec::tags(["host"])]).unwrap();
        assert_eq!(result.results.len(), 2);

        let a = &result.results[0];
        assert_eq!(
            a.group_by[0],
            GroupByResult::Tag {
                tags: vec!["host".to_string()],
                group: [("host".to_string(), "a".to_string())].into_iter().collect(),
            }
        );
        assert_eq!(a.group_by[1], GroupByResult::for_type(ValueType::Integer));
        assert_eq!(a.tags["dc"], vec!["eu", "us"]);
        assert_eq!(a.values.len(), 2);
    }

    #[test]
    fn test_value_grouping_splits_points() {
        let input = vec![series(
            &[("host", "a")],
            ValueType::Double,
            vec![
                QueryDataPoint::new(1, 3.0),
                QueryDataPoint::new(2, 12.0),
                QueryDataPoint::new(3, 7.0),
            ],
        )];

        let result = group("m", input, &[GroupBySpec::Value { range_size: 10.0 }]).unwrap();
        assert_eq!(result.results.len(), 2);
        assert_eq!(
            result.results[0].group_by[0],
            GroupByResult::Value {
                range_size: 10.0,
                group: ValueGroup { group_number: 0 }
            }
        );
        assert_eq!(
            result.results[0].values,
            vec![QueryDataPoint::new(1, 3.0), QueryDataPoint::new(3, 7.0)]
        );
        assert_eq!(result.results[1].values, vec![QueryDataPoint::new(2, 12.0)]);
    }

    #[test]
    fn test_no_samples_is_void() {
        let input = vec![series(&[("host", "a")], ValueType::Double, vec![])];
        let result = group("m", input, &[]).unwrap();
        assert!(result.is_void());
        assert_eq!(result.results[0].name, "m");
    }

    #[test]
    fn test_invalid_group_by_rejected() {
        assert!(group("m", vec![], &[GroupBySpec::Value { range_size: -1.0 }]).is_err());
    }
}
