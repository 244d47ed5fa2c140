//! Delete batch generation
//!
//! The backend has no point delete, so a point is deleted by overwriting it
//! with the sentinel of its column type. The reassembler skips those values
//! on read.

use crate::sql::path::SeriesPath;
use crate::sql::{MAGIC_SENTINEL, NULL_SENTINEL};
use crate::types::ValueType;
use std::collections::BTreeMap;

/// Collects (path, timestamp) pairs and renders the tombstone batch
#[derive(Debug, Default)]
pub struct DeleteBatchBuilder {
    /// encoded path → (column type, device, sensor, timestamps)
    entries: BTreeMap<String, PendingPath>,
}

#[derive(Debug)]
struct PendingPath {
    value_type: ValueType,
    device: String,
    sensor: String,
    timestamps: Vec<i64>,
}

impl DeleteBatchBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule one point for deletion; duplicates are collapsed
    pub fn append(&mut self, path: &SeriesPath, value_type: ValueType, timestamp: i64) {
        let pending = self
            .entries
            .entry(path.to_string())
            .or_insert_with(|| PendingPath {
                value_type,
                device: path.device(),
                sensor: path.sensor(),
                timestamps: Vec::new(),
            });

        if !pending.timestamps.contains(&timestamp) {
            pending.timestamps.push(timestamp);
        }
    }

    /// Number of distinct (path, timestamp) pairs
    pub fn len(&self) -> usize {
        self.entries.values().map(|p| p.timestamps.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Render one statement per (path, timestamp)
    pub fn build(&self) -> Vec<String> {
        let mut statements = Vec::with_capacity(self.len());
        for pending in self.entries.values() {
            let sentinel = tombstone_literal(pending.value_type);
            for ts in &pending.timestamps {
                statements.push(format!(
                    "INSERT INTO {}(timestamp, {}) VALUES({}, {})",
                    pending.device, pending.sensor, ts, sentinel
                ));
            }
        }
        statements
    }
}

fn tombstone_literal(value_type: ValueType) -> String {
    match value_type {
        ValueType::Text => format!("'{}'", NULL_SENTINEL),
        ValueType::Integer => MAGIC_SENTINEL.to_string(),
        ValueType::Double => format!("{:?}", MAGIC_SENTINEL as f64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_entry_per_distinct_point() {
        let path = SeriesPath::new("group_1", vec!["a".into(), "us".into()], "cpu.usage");
        let mut builder = DeleteBatchBuilder::new();
        builder.append(&path, ValueType::Double, 1000);
        builder.append(&path, ValueType::Double, 1000);
        builder.append(&path, ValueType::Double, 2000);

        assert_eq!(builder.len(), 2);
        let statements = builder.build();
        assert_eq!(
            statements[0],
            "INSERT INTO root.group_1.a.us(timestamp, `cpu.usage`) VALUES(1000, 2147483646.0)"
        );
        assert_eq!(
            statements[1],
            "INSERT INTO root.group_1.a.us(timestamp, `cpu.usage`) VALUES(2000, 2147483646.0)"
        );
    }

    #[test]
    fn test_sentinel_follows_column_type() {
        let text = SeriesPath::new("g", vec!["x".into()], "state");
        let int = SeriesPath::new("g", vec!["y".into()], "count");

        let mut builder = DeleteBatchBuilder::new();
        builder.append(&text, ValueType::Text, 5);
        builder.append(&int, ValueType::Integer, 6);

        let statements = builder.build();
        assert!(statements.contains(&"INSERT INTO root.g.x(timestamp, state) VALUES(5, 'NULL')".to_string()));
        assert!(statements.contains(&"INSERT INTO root.g.y(timestamp, count) VALUES(6, 2147483646)".to_string()));
    }

    #[test]
    fn test_empty_builder() {
        let builder = DeleteBatchBuilder::new();
        assert!(builder.is_empty());
        assert!(builder.build().is_empty());
    }
}
