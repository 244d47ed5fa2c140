//! Result Reassembler
//!
//! Turns column-per-path select results back into tagged series:
//!
//! 1. Each column's value type is decided once from its declared type.
//!    Columns of an unsupported type are skipped, with one warning per
//!    column when a value actually shows up in it.
//! 2. Backend nulls and tombstones (`"NULL"`, `2147483646` and its double
//!    form) are skipped; a column that never yields a real value
//!    contributes nothing, not even tags.
//! 3. Per sub-range results are merged per path by appending in sub-range
//!    order, so the merge does not depend on which shard answered first.
//!    Parts that overlap in time (a sub-range read from both its epoch and
//!    the metric's protocol machines) are re-sorted, keeping the first
//!    sample at each timestamp.
//! 4. Path segments between the reserved prefix and the sample segment are
//!    mapped back to tag keys through the registry snapshot.

use crate::backend::{BackendResult, FieldValue, RowCursor};
use crate::query::result::QueryDataPoint;
use crate::schema::TagPositions;
use crate::sql::path::{SeriesPath, PLACEHOLDER};
use crate::sql::{MAGIC_SENTINEL, NULL_SENTINEL};
use crate::types::{DataValue, ValueType};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;

/// One backend series with at least one real sample
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesData {
    pub path: SeriesPath,
    pub value_type: ValueType,
    pub points: Vec<QueryDataPoint>,
}

/// A series whose path has been mapped back to tags
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedSeries {
    pub tags: BTreeMap<String, String>,
    pub value_type: ValueType,
    pub points: Vec<QueryDataPoint>,
}

/// Outcome of decoding one field against its column type
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Value(DataValue),
    /// Null or tombstone
    Skip,
    /// Field does not fit the column type
    Mismatch,
}

/// Whether a field marks a deleted point
pub fn is_tombstone(field: &FieldValue) -> bool {
    match field {
        FieldValue::Text(s) => s == NULL_SENTINEL,
        FieldValue::Integer(v) => *v == MAGIC_SENTINEL,
        FieldValue::Double(v) => *v == MAGIC_SENTINEL as f64,
        FieldValue::Boolean(_) => false,
    }
}

/// Decode one field as `value_type`
pub fn decode(value_type: ValueType, field: Option<&FieldValue>) -> Decoded {
    let Some(field) = field else {
        return Decoded::Skip;
    };
    if is_tombstone(field) {
        return Decoded::Skip;
    }

    match (value_type, field) {
        (ValueType::Integer, FieldValue::Integer(v)) => Decoded::Value(DataValue::Integer(*v)),
        (ValueType::Double, FieldValue::Double(v)) => Decoded::Value(DataValue::Double(*v)),
        (ValueType::Double, FieldValue::Integer(v)) => Decoded::Value(DataValue::Double(*v as f64)),
        (ValueType::Text, FieldValue::Text(s)) => Decoded::Value(DataValue::Text(s.clone())),
        _ => Decoded::Mismatch,
    }
}

struct ColumnState {
    name: String,
    path: Option<SeriesPath>,
    value_type: Option<ValueType>,
    points: Vec<QueryDataPoint>,
    warned: bool,
}

impl ColumnState {
    fn warn_once(&mut self, reason: &str) {
        if !self.warned {
            tracing::warn!(column = %self.name, reason, "Skipping column with unexpected values");
            self.warned = true;
        }
    }
}

/// Drain a cursor into the series that carry at least one real value
pub async fn collect(
    cursor: &mut dyn RowCursor,
    debug_level: u8,
) -> BackendResult<Vec<SeriesData>> {
    let started = Instant::now();

    let mut columns: Vec<ColumnState> = cursor
        .columns()
        .iter()
        .map(|meta| ColumnState {
            name: meta.name.clone(),
            path: SeriesPath::parse(&meta.name),
            value_type: meta.data_type.value_type(),
            points: Vec::new(),
            warned: false,
        })
        .collect();

    for column in columns.iter_mut().filter(|c| c.path.is_none()) {
        column.warn_once("column name is not a series path");
    }

    let mut rows = 0usize;
    while let Some(row) = cursor.next_row().await? {
        rows += 1;
        for (column, field) in columns.iter_mut().zip(row.values.iter()) {
            if column.path.is_none() {
                continue;
            }
            let Some(value_type) = column.value_type else {
                if field.is_some() {
                    column.warn_once("unsupported column type");
                }
                continue;
            };

            match decode(value_type, field.as_ref()) {
                Decoded::Value(value) => column.points.push(QueryDataPoint {
                    timestamp: row.timestamp,
                    value,
                }),
                Decoded::Skip => {}
                Decoded::Mismatch => column.warn_once("value does not match column type"),
            }
        }
    }

    if debug_level >= 5 {
        tracing::debug!(
            rows,
            columns = columns.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "Cursor drained"
        );
    }

    Ok(columns
        .into_iter()
        .filter(|c| !c.points.is_empty())
        .filter_map(|c| {
            let path = c.path?;
            let value_type = c.value_type?;
            Some(SeriesData {
                path,
                value_type,
                points: c.points,
            })
        })
        .collect())
}

/// Merge per sub-range results, given in ascending sub-range order
///
/// Series are keyed by path and value type and keep the order in which
/// they first appear; points are appended sub-range by sub-range.
pub fn merge(parts: Vec<Vec<SeriesData>>) -> Vec<SeriesData> {
    let mut merged: Vec<SeriesData> = Vec::new();
    let mut index: HashMap<(SeriesPath, ValueType), usize> = HashMap::new();
    let mut unordered = BTreeSet::new();

    for part in parts {
        for series in part {
            let key = (series.path.clone(), series.value_type);
            match index.get(&key) {
                Some(&i) => {
                    let points = &mut merged[i].points;
                    if let (Some(last), Some(next)) = (points.last(), series.points.first()) {
                        if next.timestamp <= last.timestamp {
                            unordered.insert(i);
                        }
                    }
                    points.extend(series.points);
                }
                None => {
                    index.insert(key, merged.len());
                    merged.push(series);
                }
            }
        }
    }

    for i in unordered {
        let points = &mut merged[i].points;
        points.sort_by_key(|p| p.timestamp);
        points.dedup_by_key(|p| p.timestamp);
    }

    merged
}

/// Map each series' slot segments back to tag keys
pub fn tag_series(series: Vec<SeriesData>, positions: &TagPositions) -> Vec<TaggedSeries> {
    series
        .into_iter()
        .map(|s| {
            let tags = s
                .path
                .slots
                .iter()
                .enumerate()
                .filter(|(_, value)| value.as_str() != PLACEHOLDER)
                .filter_map(|(slot, value)| {
                    positions
                        .tag_at(slot)
                        .map(|key| (key.to_string(), value.clone()))
                })
                .collect();

            TaggedSeries {
                tags,
                value_type: s.value_type,
                points: s.points,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendType, ColumnMeta, Row, VecCursor};

    fn row(timestamp: i64, values: Vec<Option<FieldValue>>) -> Row {
        Row { timestamp, values }
    }

    #[test]
    fn test_tombstones_are_skipped() {
        assert_eq!(
            decode(ValueType::Text, Some(&FieldValue::Text("NULL".into()))),
            Decoded::Skip
        );
        assert_eq!(
            decode(ValueType::Integer, Some(&FieldValue::Integer(2_147_483_646))),
            Decoded::Skip
        );
        assert_eq!(
            decode(ValueType::Double, Some(&FieldValue::Double(2.147483646E9))),
            Decoded::Skip
        );
        assert_eq!(decode(ValueType::Double, None), Decoded::Skip);
        assert_eq!(
            decode(ValueType::Double, Some(&FieldValue::Integer(3))),
            Decoded::Value(DataValue::Double(3.0))
        );
        assert_eq!(
            decode(ValueType::Integer, Some(&FieldValue::Text("x".into()))),
            Decoded::Mismatch
        );
    }

    #[tokio::test]
    async fn test_only_columns_with_values_contribute() {
        let mut cursor = VecCursor::new(
            vec![
                ColumnMeta::new("root.g.a.us.`cpu.usage`", BackendType::Double),
                ColumnMeta::new("root.g.b.us.`cpu.usage`", BackendType::Double),
                ColumnMeta::new("root.g.c.us.`cpu.usage`", BackendType::Text),
            ],
            vec![
                row(
                    1000,
                    vec![
                        Some(FieldValue::Double(1.5)),
                        Some(FieldValue::Double(2_147_483_646.0)),
                        Some(FieldValue::Text("NULL".into())),
                    ],
                ),
                row(2000, vec![Some(FieldValue::Double(2.5)), None, None]),
            ],
        );

        let series = collect(&mut cursor, 0).await.unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].path.slots, vec!["a", "us"]);
        assert_eq!(
            series[0].points,
            vec![QueryDataPoint::new(1000, 1.5), QueryDataPoint::new(2000, 2.5)]
        );
    }

    #[tokio::test]
    async fn test_unsupported_type_is_skipped() {
        let mut cursor = VecCursor::new(
            vec![
                ColumnMeta::new("root.g.a.m", BackendType::Boolean),
                ColumnMeta::new("root.g.b.m", BackendType::Int64),
            ],
            vec![row(
                1,
                vec![Some(FieldValue::Boolean(true)), Some(FieldValue::Integer(4))],
            )],
        );

        let series = collect(&mut cursor, 5).await.unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].value_type, ValueType::Integer);
    }

    #[test]
    fn test_merge_follows_sub_range_order() {
        let path = SeriesPath::new("g", vec!["a".into()], "m");
        let first = vec![SeriesData {
            path: path.clone(),
            value_type: ValueType::Integer,
            points: vec![QueryDataPoint::new(1000, 1i64), QueryDataPoint::new(2000, 2i64)],
        }];
        let second = vec![
            SeriesData {
                path: SeriesPath::new("g", vec!["b".into()], "m"),
                value_type: ValueType::Integer,
                points: vec![QueryDataPoint::new(3500, 9i64)],
            },
            SeriesData {
                path: path.clone(),
                value_type: ValueType::Integer,
                points: vec![QueryDataPoint::new(3000, 3i64)],
            },
        ];

        let merged = merge(vec![first, second]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].path, path);
        let timestamps: Vec<i64> = merged[0].points.iter().map(|p| p.timestamp).collect();
        assert_eq!(timestamps, vec![1000, 2000, 3000]);
    }

    #[test]
    fn test_merge_overlapping_parts() {
        let path = SeriesPath::new("g", vec!["a".into()], "m");
        let series = |raw: &[(i64, i64)]| SeriesData {
            path: path.clone(),
            value_type: ValueType::Integer,
            points: raw.iter().map(|(t, v)| QueryDataPoint::new(*t, *v)).collect(),
        };

        let merged = merge(vec![
            vec![series(&[(1000, 1), (3000, 3)])],
            vec![series(&[(2000, 2), (3000, 30)])],
        ]);

        assert_eq!(merged.len(), 1);
        assert_eq!(
            merged[0].points,
            vec![
                QueryDataPoint::new(1000, 1i64),
                QueryDataPoint::new(2000, 2i64),
                QueryDataPoint::new(3000, 3i64),
            ]
        );
    }

    #[test]
    fn test_tags_mapped_through_registry() {
        let positions = TagPositions::from_ordered(["host", "region", "rack"]);
        let series = vec![SeriesData {
            path: SeriesPath::new("g", vec!["a".into(), "_".into(), "r1".into()], "m"),
            value_type: ValueType::Double,
            points: vec![QueryDataPoint::new(1, 1.0)],
        }];

        let tagged = tag_series(series, &positions);
        assert_eq!(tagged[0].tags.len(), 2);
        assert_eq!(tagged[0].tags["host"], "a");
        assert_eq!(tagged[0].tags["rack"], "r1");
        assert!(!tagged[0].tags.contains_key("region"));
    }
}
