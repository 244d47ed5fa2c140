//! Shard Router
//!
//! Time is partitioned into epochs by a sorted list of boundaries; each epoch
//! is served by a list of primary instances and a list of read-only
//! replicas. A query range is split at every boundary it crosses and each
//! piece is read from the first instance of its epoch that answers.
//!
//! Writes go to every primary of the epoch the timestamp falls in, or, when
//! a protocol table is configured, to every machine of the metric's protocol
//! bucket. Reads of such a metric visit its protocol machines as well as the
//! epoch, and the results are merged.
//!
//! The routing table is an immutable snapshot behind an `ArcSwap`; `reload`
//! replaces it without blocking in-flight requests.

use crate::backend::{
    Backend, BackendError, BackendResult, ColumnMeta, ConnectionPool, PoolSettings,
    PooledConnection, Row, RowCursor,
};
use crate::config::{Config, ConfigError, RoutingConfig};
use crate::types::TimeRange;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Instances serving one epoch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Epoch {
    pub primary: Vec<String>,
    pub read_only: Vec<String>,
}

/// A sub-range of a query together with the instances that hold it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedRange {
    pub range: TimeRange,
    pub epoch: usize,
    pub primary: Vec<String>,
    pub read_only: Vec<String>,
}

impl RoutedRange {
    /// Read candidates in preference order
    pub fn candidates(&self) -> impl Iterator<Item = &String> {
        self.primary.iter().chain(self.read_only.iter())
    }
}

/// Immutable routing snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTable {
    boundaries: Vec<i64>,
    epochs: Vec<Epoch>,
    protocols: Vec<Vec<String>>,
}

impl RoutingTable {
    /// A single epoch covering all time
    pub fn single(primary: Vec<String>) -> Self {
        Self {
            boundaries: Vec::new(),
            epochs: vec![Epoch {
                primary,
                read_only: Vec::new(),
            }],
            protocols: Vec::new(),
        }
    }

    /// Build from explicit parts; `epochs` must number `boundaries.len() + 1`
    pub fn new(
        mut boundaries: Vec<i64>,
        epochs: Vec<Epoch>,
        protocols: Vec<Vec<String>>,
    ) -> Result<Self, ConfigError> {
        boundaries.sort_unstable();
        if epochs.len() != boundaries.len() + 1 {
            return Err(ConfigError::Invalid(format!(
                "{} time boundaries need {} epochs, found {}",
                boundaries.len(),
                boundaries.len() + 1,
                epochs.len()
            )));
        }
        Ok(Self {
            boundaries,
            epochs,
            protocols,
        })
    }

    pub fn from_config(routing: &RoutingConfig) -> Result<Self, ConfigError> {
        routing.validate()?;

        let boundaries = routing
            .time_boundaries
            .iter()
            .map(|b| b.to_millis())
            .collect::<Result<Vec<_>, _>>()?;

        let epochs = routing
            .epochs
            .iter()
            .map(|e| Epoch {
                primary: e.primary.clone(),
                read_only: e.read_only.clone(),
            })
            .collect();

        let protocols = routing
            .protocols
            .iter()
            .map(|p| p.machines.clone())
            .collect();

        Self::new(boundaries, epochs, protocols)
    }

    pub fn boundaries(&self) -> &[i64] {
        &self.boundaries
    }

    pub fn epochs(&self) -> &[Epoch] {
        &self.epochs
    }

    /// Epoch a timestamp falls in: the number of boundaries `<= t`
    pub fn epoch_of(&self, timestamp: i64) -> usize {
        self.boundaries.partition_point(|b| *b <= timestamp)
    }

    /// Split a range at every boundary it crosses, in ascending order
    ///
    /// An empty range routes nowhere.
    pub fn route(&self, range: TimeRange) -> Vec<RoutedRange> {
        let mut routed = Vec::new();
        let mut cursor = range.start;

        while cursor < range.end {
            let epoch = self.epoch_of(cursor);
            let piece_end = self
                .boundaries
                .get(epoch)
                .map_or(range.end, |b| (*b).min(range.end));

            let Some(piece) = TimeRange::try_new(cursor, piece_end) else {
                break;
            };
            let instances = &self.epochs[epoch];
            routed.push(RoutedRange {
                range: piece,
                epoch,
                primary: instances.primary.clone(),
                read_only: instances.read_only.clone(),
            });
            cursor = piece_end;
        }

        routed
    }

    /// Instances a point of `metric` at `timestamp` is written to
    pub fn write_targets(&self, metric: &str, timestamp: i64) -> &[String] {
        if self.protocols.is_empty() {
            return &self.epochs[self.epoch_of(timestamp)].primary;
        }
        self.protocol_machines(metric)
    }

    /// Machines of the metric's protocol bucket; empty without a protocol table
    pub fn protocol_machines(&self, metric: &str) -> &[String] {
        if self.protocols.is_empty() {
            return &[];
        }
        let bucket = crc32fast::hash(metric.as_bytes()) as usize % self.protocols.len();
        &self.protocols[bucket]
    }

    /// Protocol machines to read `metric` from within a routed range
    ///
    /// Points written through the protocol table live only on these
    /// machines, so a query reads each of them alongside the epoch. Machines
    /// that are already read candidates of the epoch are left out.
    pub fn protocol_reads(&self, metric: &str, routed: &RoutedRange) -> Vec<String> {
        self.protocol_machines(metric)
            .iter()
            .filter(|machine| !routed.candidates().any(|c| c == *machine))
            .cloned()
            .collect()
    }

    /// Instances holding writable copies of `metric` within a routed range
    pub fn delete_targets(&self, metric: &str, routed: &RoutedRange) -> Vec<String> {
        let mut targets = routed.primary.clone();
        for machine in self.protocol_machines(metric) {
            if !targets.contains(machine) {
                targets.push(machine.clone());
            }
        }
        targets
    }

    /// Every instance named anywhere in the table
    pub fn all_targets(&self) -> BTreeSet<String> {
        self.epochs
            .iter()
            .flat_map(|e| e.primary.iter().chain(e.read_only.iter()))
            .chain(self.protocols.iter().flatten())
            .cloned()
            .collect()
    }
}

/// A select result together with the connection lease it reads from
pub struct ShardCursor {
    target: String,
    cursor: Box<dyn RowCursor>,
    lease: PooledConnection,
}

impl ShardCursor {
    /// Instance that answered
    pub fn target(&self) -> &str {
        &self.target
    }
}

#[async_trait]
impl RowCursor for ShardCursor {
    fn columns(&self) -> &[ColumnMeta] {
        self.cursor.columns()
    }

    async fn next_row(&mut self) -> BackendResult<Option<Row>> {
        let result = self.cursor.next_row().await;
        if let Err(e) = &result {
            if e.is_connection_error() {
                self.lease.mark_broken();
            }
        }
        result
    }
}

/// Outcome of sending one batch to several instances
#[derive(Debug, Default)]
pub struct BroadcastOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, BackendError)>,
}

impl BroadcastOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Routes statements to pooled connections
pub struct Router {
    table: ArcSwap<RoutingTable>,
    backend: Arc<dyn Backend>,
    pool_settings: PoolSettings,
    pools: DashMap<String, Arc<ConnectionPool>>,
}

impl Router {
    pub fn new(table: RoutingTable, backend: Arc<dyn Backend>, pool_settings: PoolSettings) -> Self {
        Self {
            table: ArcSwap::from_pointee(table),
            backend,
            pool_settings,
            pools: DashMap::new(),
        }
    }

    pub fn from_config(config: &Config, backend: Arc<dyn Backend>) -> Result<Self, ConfigError> {
        let table = RoutingTable::from_config(&config.routing)?;
        Ok(Self::new(table, backend, config.pool.settings()))
    }

    /// Current routing snapshot
    pub fn table(&self) -> Arc<RoutingTable> {
        self.table.load_full()
    }

    /// Swap in a new routing table
    ///
    /// Pools of instances that are no longer referenced are closed.
    pub fn reload(&self, routing: &RoutingConfig) -> Result<(), ConfigError> {
        let table = RoutingTable::from_config(routing)?;
        let keep = table.all_targets();
        self.table.store(Arc::new(table));

        self.pools.retain(|target, pool| {
            let retained = keep.contains(target);
            if !retained {
                pool.close();
                tracing::info!(instance = %target, "Closed pool for removed instance");
            }
            retained
        });
        Ok(())
    }

    pub fn route(&self, range: TimeRange) -> Vec<RoutedRange> {
        self.table.load().route(range)
    }

    pub fn write_targets(&self, metric: &str, timestamp: i64) -> Vec<String> {
        self.table.load().write_targets(metric, timestamp).to_vec()
    }

    /// Pool for an instance, created on first use
    pub fn pool(&self, target: &str) -> Arc<ConnectionPool> {
        if let Some(pool) = self.pools.get(target) {
            return Arc::clone(pool.value());
        }
        let entry = self.pools.entry(target.to_string()).or_insert_with(|| {
            Arc::new(ConnectionPool::new(
                target,
                Arc::clone(&self.backend),
                self.pool_settings.clone(),
            ))
        });
        Arc::clone(entry.value())
    }

    /// Open `core_size` connections to every instance in the table
    pub async fn prewarm(&self) -> usize {
        let targets = self.table.load().all_targets();
        let pools: Vec<_> = targets.iter().map(|t| self.pool(t)).collect();
        join_all(pools.iter().map(|p| p.prewarm())).await.into_iter().sum()
    }

    /// Run a select on one instance
    pub async fn query_on(&self, target: &str, sql: &str) -> BackendResult<ShardCursor> {
        let mut lease = self.pool(target).lease().await?;
        let cursor = lease.query(sql).await?;
        Ok(ShardCursor {
            target: target.to_string(),
            cursor,
            lease,
        })
    }

    /// Run a select for one routed sub-range
    ///
    /// Primaries are tried in order, then read-only replicas; the first
    /// instance that answers wins.
    pub async fn read(&self, routed: &RoutedRange, sql: &str) -> BackendResult<ShardCursor> {
        let mut last_error = None;

        for target in routed.candidates() {
            match self.query_on(target, sql).await {
                Ok(cursor) => return Ok(cursor),
                Err(e) => {
                    tracing::warn!(instance = %target, sql, error = %e, "Read failed, trying next instance");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| BackendError::NoTargets(routed.range.to_string())))
    }

    /// Run a batch on one instance
    pub async fn execute_on(&self, target: &str, statements: &[String]) -> BackendResult<()> {
        let mut lease = self.pool(target).lease().await?;
        lease.execute_batch(statements).await
    }

    /// Run the same batch on every target concurrently
    ///
    /// Failures are logged per target and do not affect the others.
    pub async fn broadcast(&self, targets: &[String], statements: &[String]) -> BroadcastOutcome {
        let results = join_all(
            targets
                .iter()
                .map(|target| async move { (target.clone(), self.execute_on(target, statements).await) }),
        )
        .await;

        let mut outcome = BroadcastOutcome::default();
        for (target, result) in results {
            match result {
                Ok(()) => outcome.succeeded.push(target),
                Err(e) => {
                    tracing::error!(
                        instance = %target,
                        statements = statements.len(),
                        first = statements.first().map(String::as_str).unwrap_or(""),
                        error = %e,
                        "Batch failed on instance"
                    );
                    outcome.failed.push((target, e));
                }
            }
        }
        outcome
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("table", &self.table.load())
            .field("backend", &self.backend.name())
            .field("pools", &self.pools.len())
            .finish()
    }
}
