//! In-process backend engine
//!
//! Keeps every target's series in memory and answers the same statement
//! dialect a remote engine would. Each target is an isolated instance, so
//! routing behaviour can be observed per shard. Instances can be switched
//! off to simulate an unreachable machine.

use crate::backend::statement::{parse_statement, Literal, Statement};
use crate::backend::{
    Backend, BackendError, BackendResult, BackendType, ColumnMeta, Connection, FieldValue, Row,
    RowCursor, VecCursor,
};
use crate::sql::path::join_segments;
use crate::sql::PathSegment;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// One stored series
#[derive(Debug)]
struct StoredSeries {
    device: Vec<String>,
    sensor: String,
    data_type: BackendType,
    points: BTreeMap<i64, FieldValue>,
}

/// One engine instance
#[derive(Debug)]
struct MemoryInstance {
    available: AtomicBool,
    queries: AtomicU64,
    /// encoded full path → series
    series: RwLock<BTreeMap<String, StoredSeries>>,
}

impl Default for MemoryInstance {
    fn default() -> Self {
        Self {
            available: AtomicBool::new(true),
            queries: AtomicU64::new(0),
            series: RwLock::new(BTreeMap::new()),
        }
    }
}

impl MemoryInstance {
    fn check_available(&self, target: &str) -> BackendResult<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BackendError::Connect {
                target: target.to_string(),
                message: "instance unavailable".to_string(),
            })
        }
    }

    fn select(
        &self,
        sensor: &str,
        patterns: &[Vec<PathSegment>],
        start: i64,
        end: i64,
    ) -> VecCursor {
        let series = self.series.read();

        let matched: Vec<(&String, &StoredSeries)> = series
            .iter()
            .filter(|(_, s)| s.sensor == sensor)
            .filter(|(_, s)| patterns.iter().any(|p| device_matches(p, &s.device)))
            .collect();

        let columns = matched
            .iter()
            .map(|(name, s)| ColumnMeta::new(name.as_str(), s.data_type.clone()))
            .collect();

        let timestamps: BTreeSet<i64> = matched
            .iter()
            .flat_map(|(_, s)| s.points.range(start..end.max(start)).map(|(ts, _)| *ts))
            .collect();

        let rows = timestamps
            .into_iter()
            .map(|ts| Row {
                timestamp: ts,
                values: matched.iter().map(|(_, s)| s.points.get(&ts).cloned()).collect(),
            })
            .collect();

        VecCursor::new(columns, rows)
    }

    fn insert(
        &self,
        device: Vec<PathSegment>,
        sensor: String,
        timestamp: i64,
        value: Literal,
    ) -> Result<(), String> {
        let device = device
            .into_iter()
            .map(|segment| match segment {
                PathSegment::Value(v) => Ok(v),
                PathSegment::Wildcard => Err("wildcard in insert path".to_string()),
            })
            .collect::<Result<Vec<String>, String>>()?;

        let key = join_segments(device.iter().map(String::as_str).chain([sensor.as_str()]));

        let mut series = self.series.write();
        let entry = series.entry(key).or_insert_with(|| StoredSeries {
            device,
            sensor,
            data_type: match &value {
                Literal::Integer(_) => BackendType::Int64,
                Literal::Double(_) => BackendType::Double,
                Literal::Text(_) => BackendType::Text,
            },
            points: BTreeMap::new(),
        });

        let field = match (&entry.data_type, value) {
            (BackendType::Int64, Literal::Integer(v)) => FieldValue::Integer(v),
            (BackendType::Double, Literal::Integer(v)) => FieldValue::Double(v as f64),
            (BackendType::Double, Literal::Double(v)) => FieldValue::Double(v),
            (BackendType::Text, Literal::Text(v)) => FieldValue::Text(v),
            (data_type, value) => {
                return Err(format!("cannot write {:?} into a {} series", value, data_type));
            }
        };

        entry.points.insert(timestamp, field);
        Ok(())
    }
}

fn device_matches(pattern: &[PathSegment], device: &[String]) -> bool {
    pattern.len() == device.len()
        && pattern
            .iter()
            .zip(device)
            .all(|(p, segment)| p.matches(segment))
}

/// Backend whose targets live in this process
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    instances: Arc<DashMap<String, Arc<MemoryInstance>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a target reachable or unreachable
    pub fn set_available(&self, target: &str, available: bool) {
        self.instance(target)
            .available
            .store(available, Ordering::Release);
    }

    /// Number of select statements a target has answered
    pub fn query_count(&self, target: &str) -> u64 {
        self.instances
            .get(target)
            .map(|i| i.queries.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Number of series stored on a target
    pub fn series_count(&self, target: &str) -> usize {
        self.instances
            .get(target)
            .map(|i| i.series.read().len())
            .unwrap_or(0)
    }

    /// Encoded paths stored on a target, sorted
    pub fn series_paths(&self, target: &str) -> Vec<String> {
        self.instances
            .get(target)
            .map(|i| i.series.read().keys().cloned().collect())
            .unwrap_or_default()
    }

    fn instance(&self, target: &str) -> Arc<MemoryInstance> {
        if let Some(instance) = self.instances.get(target) {
            return Arc::clone(instance.value());
        }
        let entry = self
            .instances
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(MemoryInstance::default()));
        Arc::clone(entry.value())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self, target: &str) -> BackendResult<Box<dyn Connection>> {
        let instance = self.instance(target);
        instance.check_available(target)?;
        Ok(Box::new(MemoryConnection {
            target: target.to_string(),
            instance,
        }))
    }
}

/// Connection to one in-process instance
pub struct MemoryConnection {
    target: String,
    instance: Arc<MemoryInstance>,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn target(&self) -> &str {
        &self.target
    }

    async fn query(&mut self, sql: &str) -> BackendResult<Box<dyn RowCursor>> {
        self.instance.check_available(&self.target)?;

        match parse_statement(sql) {
            Ok(Statement::Select {
                sensor,
                patterns,
                start,
                end,
            }) => {
                self.instance.queries.fetch_add(1, Ordering::Relaxed);
                Ok(Box::new(self.instance.select(&sensor, &patterns, start, end)))
            }
            Ok(_) => Err(BackendError::Statement {
                sql: sql.to_string(),
                message: "not a select statement".to_string(),
            }),
            Err(message) => Err(BackendError::Statement {
                sql: sql.to_string(),
                message,
            }),
        }
    }

    async fn execute_batch(&mut self, statements: &[String]) -> BackendResult<()> {
        self.instance.check_available(&self.target)?;

        for sql in statements {
            let result = match parse_statement(sql) {
                Ok(Statement::Insert {
                    device,
                    sensor,
                    timestamp,
                    value,
                }) => self.instance.insert(device, sensor, timestamp, value),
                Ok(_) => Err("only inserts can be batched".to_string()),
                Err(message) => Err(message),
            };

            result.map_err(|message| BackendError::Statement {
                sql: sql.clone(),
                message,
            })?;
        }
        Ok(())
    }

    async fn ping(&mut self) -> BackendResult<()> {
        self.instance.check_available(&self.target)
    }
}
