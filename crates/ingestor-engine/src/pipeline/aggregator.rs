//! Run counters and terminal transitions
//!
//! All mutation goes through the repository's per-run lock; the aggregator
//! adds the run-level rules on top (rendered failure text, logging).

use ingestor_common::{render_error, RenderingMode};
use serde_json::{Map, Value};
use std::sync::Arc;
use uuid::Uuid;

use super::chunk::ChunkTally;
use crate::error::Result;
use crate::repository::RunRepository;
use crate::types::{IngestRun, RunStart};

/// Folds chunk tallies into a run and drives its terminal state
#[derive(Clone)]
pub struct RunAggregator {
    repository: Arc<dyn RunRepository>,
    rendering: RenderingMode,
}

impl RunAggregator {
    pub fn new(repository: Arc<dyn RunRepository>, rendering: RenderingMode) -> Self {
        Self {
            repository,
            rendering,
        }
    }

    pub async fn run(&self, run_id: Uuid) -> Result<IngestRun> {
        Ok(self.repository.get_run(run_id).await?)
    }

    /// Record the source facts and move the run to `processing`
    pub async fn begin(&self, run_id: Uuid, start: RunStart) -> Result<IngestRun> {
        Ok(self.repository.mark_processing(run_id, start).await?)
    }

    /// Record how many chunks were dispatched once the source is drained
    pub async fn record_chunks(&self, run_id: Uuid, chunks: usize) -> Result<IngestRun> {
        let mut patch = Map::new();
        patch.insert("chunks".to_string(), Value::from(chunks));
        Ok(self.repository.merge_summary(run_id, patch).await?)
    }

    /// Add a chunk tally; safe under any completion order
    pub async fn increment(&self, run_id: Uuid, tally: ChunkTally) -> Result<IngestRun> {
        Ok(self
            .repository
            .increment_counters(run_id, tally.into())
            .await?)
    }

    /// Idempotent completion; `recount` trusts the row log over the counters
    #[tracing::instrument(skip(self))]
    pub async fn finalize(&self, run_id: Uuid, recount: bool) -> Result<IngestRun> {
        let run = self.repository.finalize_run(run_id, recount).await?;
        tracing::info!(
            status = %run.status,
            processed = run.processed_rows,
            successful = run.successful_rows,
            failed = run.failed_rows,
            "Run finalized"
        );
        Ok(run)
    }

    /// Mark the run failed with the rendered error; no-op when terminal
    pub async fn fail(
        &self,
        run_id: Uuid,
        error: &(dyn std::error::Error + Send + Sync + 'static),
        patch: Map<String, Value>,
    ) -> Result<IngestRun> {
        let message = render_error(error, self.rendering);
        self.fail_with_message(run_id, &message, patch).await
    }

    pub async fn fail_with_message(
        &self,
        run_id: Uuid,
        message: &str,
        patch: Map<String, Value>,
    ) -> Result<IngestRun> {
        let run = self.repository.fail_run(run_id, message, patch).await?;
        tracing::warn!(%run_id, error = %message, "Run failed");
        Ok(run)
    }

    pub fn rendering(&self) -> RenderingMode {
        self.rendering
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::{IngestError, SourceError};
    use crate::repository::InMemoryRunRepository;
    use crate::types::{Actor, CreateRunParams, RunStatus};

    async fn setup(mode: RenderingMode) -> (RunAggregator, Uuid) {
        let repo = Arc::new(InMemoryRunRepository::new());
        let run = repo
            .create_run(CreateRunParams::new("products", Actor::system()))
            .await
            .unwrap();
        (RunAggregator::new(repo, mode), run.id)
    }

    #[tokio::test]
    async fn test_counter_only_finalize() {
        let (aggregator, run_id) = setup(RenderingMode::Verbose).await;
        aggregator
            .increment(run_id, ChunkTally { processed: 2, successful: 2, failed: 0 })
            .await
            .unwrap();
        aggregator
            .increment(run_id, ChunkTally { processed: 1, successful: 0, failed: 1 })
            .await
            .unwrap();

        let run = aggregator.finalize(run_id, false).await.unwrap();
        assert_eq!(run.status, RunStatus::CompletedWithErrors);
        assert_eq!((run.processed_rows, run.successful_rows, run.failed_rows), (3, 2, 1));
    }

    #[tokio::test]
    async fn test_failure_text_follows_rendering_mode() {
        let error = IngestError::Source(SourceError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "upload.csv missing",
        )));

        let (verbose, run_id) = setup(RenderingMode::Verbose).await;
        let run = verbose.fail(run_id, &error, Map::new()).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error().unwrap().contains("upload.csv missing"));

        let (sanitized, run_id) = setup(RenderingMode::Sanitized).await;
        let run = sanitized
            .fail(run_id, &IngestError::Worker("pool exhausted".into()), Map::new())
            .await
            .unwrap();
        assert_eq!(run.error(), Some("Worker task failed: pool exhausted"));
    }

    #[tokio::test]
    async fn test_fail_runs_on_spawned_task() {
        let (aggregator, run_id) = setup(RenderingMode::Verbose).await;

        let run = tokio::spawn(async move {
            let error = IngestError::Worker("lost".into());
            aggregator.fail(run_id, &error, Map::new()).await
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(run.status, RunStatus::Failed);
    }
}
