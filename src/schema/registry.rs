//! Tag Schema Registry
//!
//! Per-metric, append-only mapping from tag key to path slot.
//!
//! Readers take an `Arc<TagPositions>` snapshot without locking. Slot
//! assignment is serialized per metric, so two writers can never hand the
//! same slot to different keys, while unrelated metrics never contend.
//!
//! # Persistence
//! When opened with a file path the registry is loaded from, and written
//! back to, a JSON document after every new assignment. The file is written
//! before the new snapshot is published.

use crate::schema::error::{SchemaError, SchemaResult};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Immutable snapshot of one metric's tag slots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagPositions {
    tag_to_slot: HashMap<String, usize>,
    slot_to_tag: Vec<String>,
}

impl TagPositions {
    /// Build from tag keys in slot order
    pub fn from_ordered<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut positions = Self::default();
        for key in keys {
            let key = key.into();
            if !positions.tag_to_slot.contains_key(&key) {
                positions.push(key);
            }
        }
        positions
    }

    fn push(&mut self, key: String) -> usize {
        let slot = self.slot_to_tag.len();
        self.tag_to_slot.insert(key.clone(), slot);
        self.slot_to_tag.push(key);
        slot
    }

    /// Slot assigned to a tag key
    pub fn slot_of(&self, key: &str) -> Option<usize> {
        self.tag_to_slot.get(key).copied()
    }

    /// Tag key stored at a slot
    pub fn tag_at(&self, slot: usize) -> Option<&str> {
        self.slot_to_tag.get(slot).map(String::as_str)
    }

    /// Highest assigned slot + 1
    pub fn slot_count(&self) -> usize {
        self.slot_to_tag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slot_to_tag.is_empty()
    }

    /// Tag keys in slot order
    pub fn keys(&self) -> &[String] {
        &self.slot_to_tag
    }
}

/// One metric's schema: a lock for writers, a swappable snapshot for readers
#[derive(Debug)]
struct MetricSchema {
    assign_lock: Mutex<()>,
    positions: ArcSwap<TagPositions>,
}

impl MetricSchema {
    fn new(positions: TagPositions) -> Self {
        Self {
            assign_lock: Mutex::new(()),
            positions: ArcSwap::from_pointee(positions),
        }
    }
}

/// Serialization format for JSON persistence
#[derive(Serialize, Deserialize)]
struct SchemaFileData {
    version: u32,
    /// metric name → tag keys in slot order
    metrics: BTreeMap<String, Vec<String>>,
}

/// JSON file holding every metric's slot order
#[derive(Debug)]
struct SchemaStore {
    path: PathBuf,
    persisted: Mutex<BTreeMap<String, Vec<String>>>,
}

impl SchemaStore {
    fn write(&self, metric: &str, keys: &[String]) -> SchemaResult<()> {
        let mut persisted = self.persisted.lock();
        persisted.insert(metric.to_string(), keys.to_vec());

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let data = SchemaFileData {
            version: 1,
            metrics: persisted.clone(),
        };

        let file = File::create(&self.path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, &data)?;
        Ok(())
    }
}

/// Concurrent registry of per-metric tag slot assignments
#[derive(Debug)]
pub struct TagSchemaRegistry {
    metrics: DashMap<String, Arc<MetricSchema>>,
    max_slots: usize,
    store: Option<SchemaStore>,
}

impl TagSchemaRegistry {
    /// Create an in-memory registry
    pub fn new(max_slots: usize) -> Self {
        Self {
            metrics: DashMap::new(),
            max_slots,
            store: None,
        }
    }

    /// Open a registry backed by a JSON file, loading it if present
    pub fn open(path: impl Into<PathBuf>, max_slots: usize) -> SchemaResult<Self> {
        let path = path.into();
        let loaded = if path.exists() {
            Self::load_from_file(&path)?
        } else {
            BTreeMap::new()
        };

        let metrics = DashMap::new();
        for (name, keys) in &loaded {
            metrics.insert(
                name.clone(),
                Arc::new(MetricSchema::new(TagPositions::from_ordered(keys.clone()))),
            );
        }

        tracing::info!(
            path = %path.display(),
            metrics = loaded.len(),
            "Loaded tag schema registry"
        );

        Ok(Self {
            metrics,
            max_slots,
            store: Some(SchemaStore {
                path,
                persisted: Mutex::new(loaded),
            }),
        })
    }

    fn load_from_file(path: &Path) -> SchemaResult<BTreeMap<String, Vec<String>>> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let data: SchemaFileData = serde_json::from_reader(reader)
            .map_err(|e| SchemaError::Serialization(format!("Failed to load tag schema: {}", e)))?;
        Ok(data.metrics)
    }

    /// Configured per-metric slot cap
    pub fn max_slots(&self) -> usize {
        self.max_slots
    }

    /// Current slot mapping of a metric, or None for an unknown metric
    pub fn resolve(&self, metric: &str) -> Option<Arc<TagPositions>> {
        self.metrics
            .get(metric)
            .map(|schema| schema.positions.load_full())
    }

    /// Slot of a tag key, allocating the next free slot for an unseen key
    pub fn assign(&self, metric: &str, tag: &str) -> SchemaResult<usize> {
        let schema = self.schema_for(metric);

        if let Some(slot) = schema.positions.load().slot_of(tag) {
            return Ok(slot);
        }

        let _guard = schema.assign_lock.lock();

        // Another writer may have won the race while we waited
        let current = schema.positions.load_full();
        if let Some(slot) = current.slot_of(tag) {
            return Ok(slot);
        }

        if current.slot_count() >= self.max_slots {
            return Err(SchemaError::CapacityExceeded {
                metric: metric.to_string(),
                tag: tag.to_string(),
                limit: self.max_slots,
            });
        }

        let mut next = (*current).clone();
        let slot = next.push(tag.to_string());

        if let Some(store) = &self.store {
            store.write(metric, next.keys())?;
        }

        schema.positions.store(Arc::new(next));
        tracing::debug!(metric, tag, slot, "Assigned tag slot");
        Ok(slot)
    }

    /// Assign every key and return the resulting snapshot
    ///
    /// Unseen keys are assigned in the order given.
    pub fn assign_all<'a>(
        &self,
        metric: &str,
        tags: impl IntoIterator<Item = &'a str>,
    ) -> SchemaResult<Arc<TagPositions>> {
        let known = self.metrics.contains_key(metric);
        for tag in tags {
            self.assign(metric, tag)?;
        }

        // A metric written without tags still has to resolve afterwards
        let schema = self.schema_for(metric);
        if !known {
            if let Some(store) = &self.store {
                let _guard = schema.assign_lock.lock();
                store.write(metric, schema.positions.load().keys())?;
            }
        }
        Ok(schema.positions.load_full())
    }

    /// Names of all known metrics
    pub fn metric_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.metrics.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of known metrics
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    fn schema_for(&self, metric: &str) -> Arc<MetricSchema> {
        if let Some(schema) = self.metrics.get(metric) {
            return Arc::clone(schema.value());
        }
        let entry = self
            .metrics
            .entry(metric.to_string())
            .or_insert_with(|| Arc::new(MetricSchema::new(TagPositions::default())));
        Arc::clone(entry.value())
    }
}
