//! Destinations for rollup results

use super::error::{RollupError, RollupResult};
use super::RollupTask;
use crate::ingest::Ingestor;
use crate::query::QueryResponse;
use async_trait::async_trait;

/// Receives the result of every rollup run
#[async_trait]
pub trait RollupSink: Send + Sync {
    async fn deliver(&self, task: &RollupTask, response: &QueryResponse) -> RollupResult<()>;
}

/// Logs a summary of each run
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl RollupSink for TracingSink {
    async fn deliver(&self, task: &RollupTask, response: &QueryResponse) -> RollupResult<()> {
        let samples: u64 = response.queries.iter().map(|q| q.sample_size).sum();
        let series: usize = response.queries.iter().map(|q| q.results.len()).sum();
        tracing::info!(
            rollup = %task.definition.name,
            id = task.id,
            samples,
            series,
            "Rollup run finished"
        );
        Ok(())
    }
}

/// Writes each run's result back under the task's `save_as` metric
#[derive(Debug, Clone)]
pub struct IngestSink {
    ingestor: Ingestor,
}

impl IngestSink {
    pub fn new(ingestor: Ingestor) -> Self {
        Self { ingestor }
    }
}

#[async_trait]
impl RollupSink for IngestSink {
    async fn deliver(&self, task: &RollupTask, response: &QueryResponse) -> RollupResult<()> {
        let Some(save_as) = task.definition.save_as.as_deref() else {
            return Err(RollupError::Sink(format!(
                "rollup {} has no save_as metric",
                task.definition.name
            )));
        };

        let mut written = 0;
        for result in response.queries.iter().filter(|q| !q.is_void()) {
            let summary = self.ingestor.write_result(save_as, result).await;
            if !summary.is_complete() {
                return Err(RollupError::Sink(format!(
                    "{} points rejected, failed instances: {:?}",
                    summary.rejected.len(),
                    summary.failed_targets
                )));
            }
            written += summary.accepted;
        }

        tracing::debug!(rollup = %task.definition.name, save_as, written, "Rollup results stored");
        Ok(())
    }
}
