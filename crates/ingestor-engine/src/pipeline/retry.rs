//! Retrying the failed rows of a finished run

use serde_json::{Map, Value};
use std::sync::Arc;
use uuid::Uuid;

use super::orchestrator::{ChunkOrchestrator, RunHandle};
use crate::error::{IngestError, Result};
use crate::repository::DEFAULT_FAILED_ROW_PAGE;
use crate::source::{FailedRowsSource, RowSource};
use crate::types::Actor;

/// Replays a run's logged failed rows through a new child run
pub struct RetryCoordinator {
    orchestrator: Arc<ChunkOrchestrator>,
    page_size: i64,
}

impl RetryCoordinator {
    pub fn new(orchestrator: Arc<ChunkOrchestrator>) -> Self {
        Self {
            orchestrator,
            page_size: DEFAULT_FAILED_ROW_PAGE,
        }
    }

    /// Failed rows fetched per repository page
    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Start a retry of `original_id`
    ///
    /// Fails with `NoFailedRows` when there is nothing to retry and with
    /// `ConcurrencyConflict` while the original or an earlier retry of it is
    /// still active. Neither case creates a run.
    #[tracing::instrument(skip(self, actor))]
    pub async fn retry(&self, original_id: Uuid, actor: Actor, dry_run: bool) -> Result<RunHandle> {
        let repository = self.orchestrator.repository().clone();
        let original = repository.get_run(original_id).await?;

        if original.failed_rows == 0 {
            return Err(IngestError::NoFailedRows(original_id));
        }
        if !original.is_terminal() {
            return Err(IngestError::ConcurrencyConflict(format!(
                "run {original_id} is still {}",
                original.status
            )));
        }
        let config = self.orchestrator.importers().get(&original.importer)?;

        let mut summary = Map::new();
        summary.insert("dry_run".to_string(), Value::Bool(dry_run));
        summary.insert("retry_of".to_string(), Value::String(original_id.to_string()));
        let run = repository.create_retry_run(original_id, actor, summary).await?;
        tracing::info!(
            run_id = %run.id,
            %original_id,
            failed_rows = original.failed_rows,
            "Retry run created"
        );

        let source = FailedRowsSource::new(
            repository,
            original_id,
            u64::try_from(original.failed_rows).ok(),
        )
        .with_page_size(self.page_size);

        self.orchestrator
            .launch(run, config, Ok(Box::new(source) as Box<dyn RowSource>), dry_run)
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::IngestSettings;
    use crate::importer::{
        FieldMapping, ImporterRegistry, IngestConfig, TargetEntity, TransformRegistry,
    };
    use crate::repository::{CounterDelta, InMemoryRunRepository, RunRepository};
    use crate::source::SourceRegistry;
    use crate::store::InMemoryEntityStore;
    use crate::types::{CreateRunParams, NewIngestRow, RowError, RowStatus, RunStatus};
    use serde_json::json;

    async fn setup() -> (RetryCoordinator, Arc<InMemoryRunRepository>) {
        let mut importers = ImporterRegistry::new(TransformRegistry::default());
        importers
            .register(
                IngestConfig::builder("products", "memory", TargetEntity::new("products"))
                    .field(FieldMapping::new("sku", "sku"))
                    .build(),
            )
            .unwrap();
        let repo = Arc::new(InMemoryRunRepository::new());
        let orchestrator = ChunkOrchestrator::new(
            Arc::new(importers),
            Arc::new(SourceRegistry::default()),
            Arc::new(InMemoryEntityStore::new()),
            repo.clone(),
            IngestSettings::default(),
        );
        (RetryCoordinator::new(Arc::new(orchestrator)), repo)
    }

    #[tokio::test]
    async fn test_processing_original_is_a_conflict() {
        let (coordinator, repo) = setup().await;
        let run = repo
            .create_run(CreateRunParams::new("products", Actor::system()))
            .await
            .unwrap();
        repo.insert_rows(
            run.id,
            &[NewIngestRow {
                row_number: 1,
                status: RowStatus::Failed,
                data: json!({ "sku": "A1" }).as_object().cloned().unwrap(),
                errors: Some(RowError::message("bad")),
            }],
        )
        .await
        .unwrap();
        repo.increment_counters(
            run.id,
            CounterDelta {
                processed: 1,
                successful: 0,
                failed: 1,
            },
        )
        .await
        .unwrap();

        let err = coordinator.retry(run.id, Actor::system(), false).await.unwrap_err();

        assert!(matches!(err, IngestError::ConcurrencyConflict(_)));
        assert!(repo.retries_of(run.id).await.is_empty());
        assert_eq!(repo.get_run(run.id).await.unwrap().status, RunStatus::Processing);
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let (coordinator, _repo) = setup().await;
        let err = coordinator
            .retry(Uuid::new_v4(), Actor::system(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::RunNotFound(_)));
    }
}
