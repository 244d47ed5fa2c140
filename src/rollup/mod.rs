//! Rollups
//!
//! A rollup is a stored query that re-runs on a fixed schedule, a simple
//! materialized view. Tasks are submitted as JSON, get an id derived from
//! their creation time and run until the scheduler shuts down; there is no
//! per-task removal.
//!
//! ```text
//! register(json) ──parse──▶ RollupTask ──spawn──▶ tick ─▶ QueryExecutor ─▶ RollupSink
//!                                                   ▲                          │
//!                                                   └──────── interval ────────┘
//! ```

mod error;
mod parser;
mod scheduler;
mod sink;

pub use error::{RollupError, RollupResult};
pub use parser::{parse_definition, RollupDefinition};
pub use scheduler::RollupScheduler;
pub use sink::{IngestSink, RollupSink, TracingSink};

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A registered rollup and its run counters
#[derive(Debug, Serialize)]
pub struct RollupTask {
    /// Creation time in epoch ms, bumped to stay unique
    pub id: i64,
    pub definition: RollupDefinition,
    #[serde(skip)]
    pub interval: Duration,
    runs: AtomicU64,
    failures: AtomicU64,
}

impl RollupTask {
    pub fn new(id: i64, definition: RollupDefinition, interval: Duration) -> Self {
        Self {
            id,
            definition,
            interval,
            runs: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Runs started so far
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    /// Runs that failed in the query or the sink
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub(crate) fn record_run(&self) {
        self.runs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}
