//! Rollup scheduler
//!
//! Each registered task gets its own tokio task that runs the embedded query
//! immediately and then at a fixed rate. A tick that falls due while the
//! previous run is still going is skipped, not queued. Failed runs are
//! logged and counted; the task stays scheduled.

use super::error::{RollupError, RollupResult};
use super::parser::{parse_definition, RollupDefinition};
use super::sink::RollupSink;
use super::RollupTask;
use crate::config::RollupConfig;
use crate::query::QueryExecutor;
use crate::types::now_millis;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

struct Scheduled {
    task: Arc<RollupTask>,
    handle: JoinHandle<()>,
}

/// Runs registered rollup tasks until shutdown
pub struct RollupScheduler {
    executor: QueryExecutor,
    sink: Arc<dyn RollupSink>,
    max_rollups: usize,
    default_interval: Duration,
    last_id: AtomicI64,
    tasks: Mutex<BTreeMap<i64, Scheduled>>,
    closed: AtomicBool,
}

impl RollupScheduler {
    pub fn new(executor: QueryExecutor, sink: Arc<dyn RollupSink>, config: &RollupConfig) -> Self {
        Self {
            executor,
            sink,
            max_rollups: config.max_rollups,
            default_interval: Duration::from_secs(config.default_interval_secs.max(1)),
            last_id: AtomicI64::new(0),
            tasks: Mutex::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Parse a task definition and schedule it
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(&self, json: &str) -> RollupResult<Arc<RollupTask>> {
        let definition = parse_definition(json)?;
        self.register_definition(definition)
    }

    /// Schedule an already parsed definition
    pub fn register_definition(&self, definition: RollupDefinition) -> RollupResult<Arc<RollupTask>> {
        definition.validate()?;

        let mut tasks = self.tasks.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(RollupError::ShutDown);
        }
        if tasks.len() >= self.max_rollups {
            return Err(RollupError::LimitReached(self.max_rollups));
        }

        let interval = definition
            .execution_interval
            .map(|d| d.to_std())
            .unwrap_or(self.default_interval);
        let task = Arc::new(RollupTask::new(self.next_id(), definition, interval));

        let handle = tokio::spawn(run_forever(
            self.executor.clone(),
            Arc::clone(&self.sink),
            Arc::clone(&task),
        ));
        tasks.insert(
            task.id,
            Scheduled {
                task: Arc::clone(&task),
                handle,
            },
        );

        tracing::info!(
            rollup = %task.definition.name,
            id = task.id,
            interval_secs = interval.as_secs(),
            "Registered rollup task"
        );
        Ok(task)
    }

    /// Registered tasks, oldest first
    pub fn list(&self) -> Vec<Arc<RollupTask>> {
        self.tasks
            .lock()
            .values()
            .map(|s| Arc::clone(&s.task))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Stop every task and refuse new registrations
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for scheduled in tasks.values() {
            scheduled.handle.abort();
        }
        tracing::info!(tasks = tasks.len(), "Rollup scheduler shut down");
    }

    /// Creation-time id, strictly increasing even within one millisecond
    fn next_id(&self) -> i64 {
        let now = now_millis();
        let mut last = self.last_id.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(last + 1);
            match self.last_id.compare_exchange_weak(
                last,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(current) => last = current,
            }
        }
    }
}

impl Drop for RollupScheduler {
    fn drop(&mut self) {
        for scheduled in self.tasks.get_mut().values() {
            scheduled.handle.abort();
        }
    }
}

impl std::fmt::Debug for RollupScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollupScheduler")
            .field("tasks", &self.len())
            .field("max_rollups", &self.max_rollups)
            .field("default_interval", &self.default_interval)
            .finish()
    }
}

async fn run_forever(executor: QueryExecutor, sink: Arc<dyn RollupSink>, task: Arc<RollupTask>) {
    let mut ticker = tokio::time::interval(task.interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        run_once(&executor, sink.as_ref(), &task).await;
    }
}

async fn run_once(executor: &QueryExecutor, sink: &dyn RollupSink, task: &RollupTask) {
    task.record_run();
    let started = std::time::Instant::now();

    let outcome = match executor.execute(&task.definition.query).await {
        Ok(response) => sink.deliver(task, &response).await,
        Err(e) => Err(RollupError::Sink(format!("query failed: {}", e))),
    };

    match outcome {
        Ok(()) => tracing::debug!(
            rollup = %task.definition.name,
            id = task.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Rollup run succeeded"
        ),
        Err(e) => {
            task.record_failure();
            tracing::error!(
                rollup = %task.definition.name,
                id = task.id,
                error = %e,
                "Rollup run failed, will retry on next tick"
            );
        }
    }
}
