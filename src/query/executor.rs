//! Query Executor
//!
//! Runs a tag query end to end:
//!
//! ```text
//! QueryRequest → resolve slots → compile paths → route sub-ranges
//!              → read (concurrently) → merge → tag → group → aggregate
//! ```
//!
//! A metric the registry has never seen, or a filter on a tag key the metric
//! never had, yields a void result rather than an error. A sub-range whose
//! instances all fail is dropped from the result and reported as a warning.
//! With a protocol table configured, each sub-range is also read from the
//! metric's protocol machines and the parts are merged.
//!
//! Deletes follow the same path up to the read, then overwrite every point
//! found with the tombstone sentinel of its column type.

use crate::aggregation::{self, Pipeline};
use crate::backend::BackendResult;
use crate::ingest::Ingestor;
use crate::query::error::QueryResult;
use crate::query::model::{MetricQuery, QueryRequest};
use crate::query::reassembler::{self, SeriesData};
use crate::query::result::{MetricResult, QueryResponse};
use crate::router::{RoutedRange, Router};
use crate::schema::TagSchemaRegistry;
use crate::sql::{CompiledQuery, DeleteBatchBuilder};
use crate::types::{now_millis, TimeRange};
use futures_util::future::{join_all, try_join_all};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Outcome of a delete request
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeleteSummary {
    /// Points overwritten with a tombstone, summed over instances
    pub points: usize,
    /// Instances whose delete batch failed
    pub failed_targets: Vec<String>,
}

/// One read of a routed sub-range: its epoch with fail-over, or a single
/// protocol machine
struct ShardRead<'a> {
    routed: &'a RoutedRange,
    machine: Option<String>,
}

/// Query executor
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    registry: Arc<TagSchemaRegistry>,
    router: Arc<Router>,
    /// Writes `save_as` results; without it they are skipped with a warning
    ingestor: Option<Ingestor>,
    debug_level: u8,
}

impl QueryExecutor {
    /// Create a new query executor
    pub fn new(registry: Arc<TagSchemaRegistry>, router: Arc<Router>) -> Self {
        Self {
            registry,
            router,
            ingestor: None,
            debug_level: 0,
        }
    }

    pub fn with_ingestor(mut self, ingestor: Ingestor) -> Self {
        self.ingestor = Some(ingestor);
        self
    }

    /// Stage timing verbosity: 2 query, 3 metric, 4 stage, 5 cursor
    pub fn with_debug_level(mut self, debug_level: u8) -> Self {
        self.debug_level = debug_level;
        self
    }

    /// Parse and execute a JSON query document
    pub async fn execute_str(&self, json: &str) -> QueryResult<QueryResponse> {
        let request = QueryRequest::from_json(json)?;
        self.execute(&request).await
    }

    /// Execute a query, resolving relative times against the clock
    pub async fn execute(&self, request: &QueryRequest) -> QueryResult<QueryResponse> {
        let window = request.time_range(now_millis())?;
        self.execute_window(request, window).await
    }

    /// Execute a query over an already resolved window
    pub async fn execute_window(
        &self,
        request: &QueryRequest,
        window: TimeRange,
    ) -> QueryResult<QueryResponse> {
        let started = Instant::now();

        let queries = try_join_all(
            request
                .metrics
                .iter()
                .map(|metric| self.execute_metric(metric, window)),
        )
        .await?;

        if self.debug_level >= 2 {
            tracing::debug!(
                metrics = queries.len(),
                window = %window,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Query finished"
            );
        }

        Ok(QueryResponse { queries })
    }

    /// Execute one metric's part of a query
    pub async fn execute_metric(
        &self,
        metric: &MetricQuery,
        window: TimeRange,
    ) -> QueryResult<MetricResult> {
        let started = Instant::now();

        // Reject bad aggregator definitions before touching the backend
        let pipeline = Pipeline::build(&metric.aggregators, window)?;
        for group_by in &metric.group_by {
            group_by.validate()?;
        }

        let Some(positions) = self.registry.resolve(&metric.name) else {
            tracing::debug!(metric = %metric.name, "Unknown metric");
            return Ok(MetricResult::void(&metric.name));
        };
        let Some(compiled) = CompiledQuery::compile(&metric.name, &positions, &metric.tags) else {
            tracing::debug!(metric = %metric.name, tags = ?metric.tags, "Filter on unknown tag key");
            return Ok(MetricResult::void(&metric.name));
        };

        let table = self.router.table();
        let routed = table.route(window);
        let mut reads = Vec::with_capacity(routed.len());
        for sub in &routed {
            reads.push(ShardRead {
                routed: sub,
                machine: None,
            });
            for machine in table.protocol_reads(&metric.name, sub) {
                reads.push(ShardRead {
                    routed: sub,
                    machine: Some(machine),
                });
            }
        }
        let results = join_all(reads.iter().map(|r| self.read_range(&compiled, r))).await;

        let mut parts = Vec::with_capacity(results.len());
        let mut warnings = Vec::new();
        for (read, result) in reads.iter().zip(results) {
            match result {
                Ok(series) => parts.push(series),
                Err(e) => {
                    tracing::warn!(
                        metric = %metric.name,
                        range = %read.routed.range,
                        instance = read.machine.as_deref().unwrap_or("epoch"),
                        error = %e,
                        "Sub-range unavailable, returning partial result"
                    );
                    warnings.push(match &read.machine {
                        Some(machine) => format!(
                            "range {} unavailable on {}: {}",
                            read.routed.range, machine, e
                        ),
                        None => format!("range {} unavailable: {}", read.routed.range, e),
                    });
                }
            }
        }
        let read_done = Instant::now();

        let mut merged = reassembler::merge(parts);
        merged.retain(|s| compiled.accepts(&s.path));
        let series = reassembler::tag_series(merged, &positions);
        let grouped = aggregation::group(&metric.name, series, &metric.group_by)?;
        let result = if self.debug_level >= 4 {
            pipeline.run_timed(grouped, &metric.name)
        } else {
            pipeline.run(grouped)
        };
        let mut result = result.with_warnings(warnings);

        for target in pipeline.save_as_targets() {
            match &self.ingestor {
                Some(ingestor) if !result.is_void() => {
                    let summary = ingestor.write_result(&target, &result).await;
                    if !summary.is_complete() {
                        result.warnings.push(format!(
                            "save_as {}: {} rejected, {} instance(s) failed",
                            target,
                            summary.rejected.len(),
                            summary.failed_targets.len()
                        ));
                    }
                }
                Some(_) => {}
                None => {
                    tracing::warn!(metric = %metric.name, save_as = %target, "save_as without a writer");
                    result
                        .warnings
                        .push(format!("save_as {} skipped: no writer configured", target));
                }
            }
        }

        if self.debug_level >= 3 {
            tracing::debug!(
                metric = %metric.name,
                sub_ranges = routed.len(),
                samples = result.sample_size,
                read_ms = read_done.duration_since(started).as_millis() as u64,
                total_ms = started.elapsed().as_millis() as u64,
                "Metric finished"
            );
        }

        Ok(result)
    }

    async fn read_range(
        &self,
        compiled: &CompiledQuery,
        read: &ShardRead<'_>,
    ) -> BackendResult<Vec<SeriesData>> {
        let sql = compiled.select(read.routed.range).to_sql();
        if self.debug_level >= 4 {
            tracing::debug!(epoch = read.routed.epoch, machine = ?read.machine, sql = %sql, "Reading sub-range");
        }
        let mut cursor = match &read.machine {
            Some(machine) => self.router.query_on(machine, &sql).await?,
            None => self.router.read(read.routed, &sql).await?,
        };
        reassembler::collect(&mut cursor, self.debug_level).await
    }

    /// Tombstone every point a query matches
    ///
    /// Each routed sub-range is read and rewritten on every instance that
    /// holds a writable copy of it. Instances fail independently; nothing is
    /// rolled back.
    pub async fn delete(&self, request: &QueryRequest) -> QueryResult<DeleteSummary> {
        let window = request.time_range(now_millis())?;
        self.delete_window(request, window).await
    }

    /// Delete over an already resolved window
    pub async fn delete_window(
        &self,
        request: &QueryRequest,
        window: TimeRange,
    ) -> QueryResult<DeleteSummary> {
        let table = self.router.table();
        let mut summary = DeleteSummary::default();

        for metric in &request.metrics {
            let Some(positions) = self.registry.resolve(&metric.name) else {
                continue;
            };
            let Some(compiled) = CompiledQuery::compile(&metric.name, &positions, &metric.tags)
            else {
                continue;
            };

            for routed in table.route(window) {
                let sql = compiled.select(routed.range).to_sql();
                let targets = table.delete_targets(&metric.name, &routed);

                let outcomes = join_all(
                    targets
                        .iter()
                        .map(|target| self.delete_on(target, &compiled, &sql)),
                )
                .await;

                for (target, outcome) in targets.into_iter().zip(outcomes) {
                    match outcome {
                        Ok(points) => summary.points += points,
                        Err(e) => {
                            tracing::error!(
                                instance = %target,
                                metric = %metric.name,
                                sql = %sql,
                                error = %e,
                                "Delete abandoned on instance"
                            );
                            if !summary.failed_targets.contains(&target) {
                                summary.failed_targets.push(target);
                            }
                        }
                    }
                }
            }
        }

        tracing::info!(
            points = summary.points,
            failed = summary.failed_targets.len(),
            "Delete finished"
        );
        Ok(summary)
    }

    async fn delete_on(
        &self,
        target: &str,
        compiled: &CompiledQuery,
        sql: &str,
    ) -> BackendResult<usize> {
        let series = {
            let mut cursor = self.router.query_on(target, sql).await?;
            reassembler::collect(&mut cursor, self.debug_level).await?
        };

        let mut batch = DeleteBatchBuilder::new();
        for s in series.iter().filter(|s| compiled.accepts(&s.path)) {
            for point in &s.points {
                batch.append(&s.path, s.value_type, point.timestamp);
            }
        }
        if batch.is_empty() {
            return Ok(0);
        }

        let points = batch.len();
        self.router.execute_on(target, &batch.build()).await?;
        tracing::debug!(instance = %target, points, "Tombstones written");
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{AggregatorSpec, GroupBySpec, RangeSpec};
    use crate::backend::{MemoryBackend, PoolSettings};
    use crate::ingest::DataPoint;
    use crate::query::result::{GroupByResult, QueryDataPoint};
    use crate::router::{Epoch, RoutingTable};
    use crate::types::{DataValue, ValueType};

    struct Fixture {
        backend: MemoryBackend,
        ingestor: Ingestor,
        executor: QueryExecutor,
    }

    fn fixture(table: RoutingTable) -> Fixture {
        let backend = MemoryBackend::new();
        let registry = Arc::new(TagSchemaRegistry::new(8));
        let router = Arc::new(Router::new(
            table,
            Arc::new(backend.clone()),
            PoolSettings::default(),
        ));
        let ingestor = Ingestor::new(Arc::clone(&registry), Arc::clone(&router), 4);
        let executor = QueryExecutor::new(registry, router).with_ingestor(ingestor.clone());
        Fixture {
            backend,
            ingestor,
            executor,
        }
    }

    fn sharded() -> RoutingTable {
        RoutingTable::new(
            vec![3000],
            vec![
                Epoch {
                    primary: vec!["old".to_string()],
                    read_only: vec![],
                },
                Epoch {
                    primary: vec!["new".to_string()],
                    read_only: vec![],
                },
            ],
            Vec::new(),
        )
        .unwrap()
    }

    async fn write(fixture: &Fixture, points: Vec<DataPoint>) {
        let summary = fixture.ingestor.write_batch(&points).await;
        assert!(summary.is_complete(), "{:?}", summary);
    }

    fn request(range: TimeRange, metric: MetricQuery) -> QueryRequest {
        QueryRequest::absolute(range, vec![metric])
    }

    #[tokio::test]
    async fn test_unknown_metric_is_void() {
        let f = fixture(RoutingTable::single(vec!["a".to_string()]));
        let response = f
            .executor
            .execute_window(
                &request(TimeRange::new(0, 10), MetricQuery::new("missing")),
                TimeRange::new(0, 10),
            )
            .await
            .unwrap();

        assert_eq!(response.queries.len(), 1);
        assert!(response.queries[0].is_void());
        assert_eq!(response.queries[0].results[0].name, "missing");
        assert_eq!(f.backend.query_count("a"), 0);
    }

    #[tokio::test]
    async fn test_unknown_tag_key_is_void() {
        let f = fixture(RoutingTable::single(vec!["a".to_string()]));
        write(&f, vec![DataPoint::new("cpu", 1, 1.0).tag("host", "h1")]).await;

        let window = TimeRange::new(0, 10);
        let result = f
            .executor
            .execute_metric(&MetricQuery::new("cpu").tag("rack", "r1"), window)
            .await
            .unwrap();
        assert!(result.is_void());
    }

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let f = fixture(RoutingTable::single(vec!["a".to_string()]));
        write(
            &f,
            vec![
                DataPoint::new("cpu.usage", 1000, 1.5)
                    .tag("host", "a")
                    .tag("region", "us"),
                DataPoint::new("cpu.usage", 2000, 2.5)
                    .tag("host", "a")
                    .tag("region", "us"),
                DataPoint::new("cpu.usage", 1500, 9.0)
                    .tag("host", "b")
                    .tag("region", "us"),
                DataPoint::new("status", 1000, "up").tag("host", "a"),
            ],
        )
        .await;

        let window = TimeRange::new(0, 5000);
        let result = f
            .executor
            .execute_metric(&MetricQuery::new("cpu.usage").tag("host", "a"), window)
            .await
            .unwrap();

        assert_eq!(result.sample_size, 2);
        let series = &result.results[0];
        assert_eq!(series.tags["host"], vec!["a"]);
        assert_eq!(series.tags["region"], vec!["us"]);
        assert_eq!(
            series.values,
            vec![QueryDataPoint::new(1000, 1.5), QueryDataPoint::new(2000, 2.5)]
        );

        let status = f
            .executor
            .execute_metric(&MetricQuery::new("status"), window)
            .await
            .unwrap();
        assert_eq!(
            status.results[0].group_by,
            vec![GroupByResult::for_type(ValueType::Text)]
        );
        assert_eq!(status.results[0].values[0].value, DataValue::Text("up".into()));
    }

    #[tokio::test]
    async fn test_cross_shard_query_is_merged_in_order() {
        let f = fixture(sharded());
        write(
            &f,
            vec![
                DataPoint::new("m", 1000, 1i64).tag("host", "a"),
                DataPoint::new("m", 2999, 2i64).tag("host", "a"),
                DataPoint::new("m", 3000, 3i64).tag("host", "a"),
                DataPoint::new("m", 4500, 4i64).tag("host", "a"),
            ],
        )
        .await;
        assert_eq!(f.backend.series_count("old"), 1);
        assert_eq!(f.backend.series_count("new"), 1);

        let result = f
            .executor
            .execute_metric(&MetricQuery::new("m"), TimeRange::new(1000, 5000))
            .await
            .unwrap();

        let timestamps: Vec<i64> = result.results[0].values.iter().map(|p| p.timestamp).collect();
        assert_eq!(timestamps, vec![1000, 2999, 3000, 4500]);
        assert_eq!(f.backend.query_count("old"), 1);
        assert_eq!(f.backend.query_count("new"), 1);
    }

    #[tokio::test]
    async fn test_protocol_sharded_points_are_read_back() {
        let table = RoutingTable::new(
            Vec::new(),
            vec![Epoch {
                primary: vec!["a".to_string()],
                read_only: vec![],
            }],
            vec![vec!["p0".to_string()], vec!["p1".to_string()]],
        )
        .unwrap();
        let f = fixture(table);
        f.ingestor
            .write(&DataPoint::new("cpu", 1000, 1.0).tag("host", "h"))
            .await
            .unwrap();
        assert_eq!(f.backend.series_count("a"), 0);

        let result = f
            .executor
            .execute_metric(&MetricQuery::new("cpu"), TimeRange::new(0, 5000))
            .await
            .unwrap();

        assert_eq!(result.sample_size, 1);
        assert!(result.warnings.is_empty());
        assert_eq!(result.results[0].tags["host"], vec!["h"]);
    }

    #[tokio::test]
    async fn test_series_written_before_schema_growth_still_match() {
        let f = fixture(RoutingTable::single(vec!["a".to_string()]));
        f.ingestor
            .write(&DataPoint::new("cpu", 1000, 1.0).tag("host", "a"))
            .await
            .unwrap();
        f.ingestor
            .write(
                &DataPoint::new("cpu", 2000, 2.0)
                    .tag("host", "b")
                    .tag("region", "us"),
            )
            .await
            .unwrap();
        assert_eq!(f.backend.series_count("a"), 2);

        let window = TimeRange::new(0, 5000);
        let host_a = f
            .executor
            .execute_metric(&MetricQuery::new("cpu").tag("host", "a"), window)
            .await
            .unwrap();
        assert_eq!(host_a.sample_size, 1);
        assert_eq!(host_a.results[0].values, vec![QueryDataPoint::new(1000, 1.0)]);

        let all = f
            .executor
            .execute_metric(&MetricQuery::new("cpu"), window)
            .await
            .unwrap();
        assert_eq!(all.sample_size, 2);

        let us = f
            .executor
            .execute_metric(&MetricQuery::new("cpu").tag("region", "us"), window)
            .await
            .unwrap();
        assert_eq!(us.sample_size, 1);
    }

    #[tokio::test]
    async fn test_wide_multi_value_filter_is_answered() {
        let f = fixture(RoutingTable::single(vec!["a".to_string()]));
        let point = |ts: i64, last: &str| {
            (0..8).fold(DataPoint::new("m", ts, 1i64), |p, k| {
                let value = if k == 7 { last.to_string() } else { "v3".to_string() };
                p.tag(format!("k{}", k), value)
            })
        };
        write(&f, vec![point(1000, "v3"), point(2000, "v99")]).await;

        let query = (0..8).fold(MetricQuery::new("m"), |q, k| {
            (0..10).fold(q, |q, v| q.tag(format!("k{}", k), format!("v{}", v)))
        });
        let result = f
            .executor
            .execute_metric(&query, TimeRange::new(0, 5000))
            .await
            .unwrap();

        assert_eq!(result.sample_size, 1);
        assert_eq!(result.results[0].values[0].timestamp, 1000);
    }

    #[tokio::test]
    async fn test_unavailable_shard_yields_warning() {
        let f = fixture(sharded());
        write(
            &f,
            vec![
                DataPoint::new("m", 1000, 1i64),
                DataPoint::new("m", 4000, 2i64),
            ],
        )
        .await;
        f.backend.set_available("old", false);

        let result = f
            .executor
            .execute_metric(&MetricQuery::new("m"), TimeRange::new(0, 5000))
            .await
            .unwrap();

        assert_eq!(result.sample_size, 1);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("[0, 3000)"));
    }

    #[tokio::test]
    async fn test_group_by_and_aggregate() {
        let f = fixture(RoutingTable::single(vec!["a".to_string()]));
        write(
            &f,
            vec![
                DataPoint::new("cpu", 1000, 1.0).tag("host", "a"),
                DataPoint::new("cpu", 2000, 3.0).tag("host", "a"),
                DataPoint::new("cpu", 1000, 10.0).tag("host", "b"),
            ],
        )
        .await;

        let metric = MetricQuery::new("cpu")
            .group_by(GroupBySpec::tags(["host"]))
            .aggregator(AggregatorSpec::Avg(RangeSpec::default()));
        let result = f
            .executor
            .execute_metric(&metric, TimeRange::new(0, 5000))
            .await
            .unwrap();

        assert_eq!(result.results.len(), 2);
        assert_eq!(result.results[0].values, vec![QueryDataPoint::new(1000, 2.0)]);
        assert_eq!(result.results[1].values, vec![QueryDataPoint::new(1000, 10.0)]);
        assert_eq!(result.sample_size, 3);
    }

    #[tokio::test]
    async fn test_invalid_aggregator_fails_query() {
        let f = fixture(RoutingTable::single(vec!["a".to_string()]));
        let metric = MetricQuery::new("cpu").aggregator(AggregatorSpec::Div { divisor: 0.0 });
        let err = f
            .executor
            .execute_metric(&metric, TimeRange::new(0, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::query::QueryError::Aggregation(_)));
    }

    #[tokio::test]
    async fn test_save_as_writes_result() {
        let f = fixture(RoutingTable::single(vec!["a".to_string()]));
        write(
            &f,
            vec![
                DataPoint::new("cpu", 1000, 2.0).tag("host", "a"),
                DataPoint::new("cpu", 2000, 4.0).tag("host", "a"),
            ],
        )
        .await;

        let metric = MetricQuery::new("cpu")
            .aggregator(AggregatorSpec::Sum(RangeSpec::default()))
            .aggregator(AggregatorSpec::SaveAs {
                metric_name: "cpu.sum".to_string(),
            });
        f.executor
            .execute_metric(&metric, TimeRange::new(0, 5000))
            .await
            .unwrap();

        let saved = f
            .executor
            .execute_metric(&MetricQuery::new("cpu.sum"), TimeRange::new(0, 5000))
            .await
            .unwrap();
        assert_eq!(saved.results[0].values, vec![QueryDataPoint::new(1000, 6.0)]);
        assert_eq!(saved.results[0].tags["host"], vec!["a"]);
    }

    #[tokio::test]
    async fn test_delete_tombstones_points() {
        let f = fixture(sharded());
        write(
            &f,
            vec![
                DataPoint::new("m", 1000, 1i64).tag("host", "a"),
                DataPoint::new("m", 4000, 2i64).tag("host", "a"),
                DataPoint::new("m", 4000, 7i64).tag("host", "b"),
                DataPoint::new("t", 4000, "x").tag("host", "a"),
            ],
        )
        .await;

        let window = TimeRange::new(0, 5000);
        let summary = f
            .executor
            .delete_window(&request(window, MetricQuery::new("m").tag("host", "a")), window)
            .await
            .unwrap();
        assert_eq!(summary.points, 2);
        assert!(summary.failed_targets.is_empty());

        let summary = f
            .executor
            .delete_window(&request(window, MetricQuery::new("t")), window)
            .await
            .unwrap();
        assert_eq!(summary.points, 1);

        let remaining = f
            .executor
            .execute_metric(&MetricQuery::new("m"), window)
            .await
            .unwrap();
        assert_eq!(remaining.sample_size, 1);
        assert_eq!(remaining.results[0].tags["host"], vec!["b"]);

        let text = f
            .executor
            .execute_metric(&MetricQuery::new("t"), window)
            .await
            .unwrap();
        assert!(text.is_void());
    }

    #[tokio::test]
    async fn test_execute_str() {
        let f = fixture(RoutingTable::single(vec!["a".to_string()]));
        write(&f, vec![DataPoint::new("m", 1000, 5i64)]).await;

        let response = f
            .executor
            .execute_str(r#"{"start_absolute": 0, "end_absolute": 2000, "metrics": [{"name": "m"}]}"#)
            .await
            .unwrap();
        assert_eq!(
            response.queries[0].results[0].values,
            vec![QueryDataPoint::new(1000, 5i64)]
        );
    }

    #[tokio::test]
    async fn test_huge_sampling_collapses_to_one_bucket() {
        let f = fixture(RoutingTable::single(vec!["a".to_string()]));
        write(
            &f,
            vec![
                DataPoint::new("cpu", 1000, 1.0),
                DataPoint::new("cpu", 2000, 2.0),
            ],
        )
        .await;

        let response = f
            .executor
            .execute_str(
                r#"{"start_absolute": 500, "end_absolute": 5000, "metrics": [{"name": "cpu",
                    "aggregators": [{"name": "sum",
                        "sampling": {"value": 1000000000000000, "unit": "years"}}]}]}"#,
            )
            .await
            .unwrap();
        assert_eq!(
            response.queries[0].results[0].values,
            vec![QueryDataPoint::new(1000, 3.0)]
        );
    }
}
