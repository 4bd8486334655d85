//! Engine facade
//!
//! Wires the importer registry, sources, entity store and run repository
//! into one object exposing the run operations.

use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::analysis::{ErrorAnalysis, ErrorAnalyzer};
use crate::config::IngestSettings;
use crate::error::Result;
use crate::importer::ImporterRegistry;
use crate::pipeline::{ChunkOrchestrator, RetryCoordinator, RunEvent, RunHandle};
use crate::repository::{InMemoryRunRepository, PgRunRepository, RunRepository};
use crate::source::{SourcePayload, SourceRegistry};
use crate::store::{EntityStore, InMemoryEntityStore, PgEntityStore};
use crate::types::{Actor, IngestRun};

/// Ingestion engine
pub struct IngestEngine {
    orchestrator: Arc<ChunkOrchestrator>,
    retries: RetryCoordinator,
    analyzer: ErrorAnalyzer,
}

/// Builder for [`IngestEngine`]; store and repository default to in-memory
#[derive(Default)]
pub struct IngestEngineBuilder {
    importers: ImporterRegistry,
    sources: SourceRegistry,
    store: Option<Arc<dyn EntityStore>>,
    repository: Option<Arc<dyn RunRepository>>,
    settings: IngestSettings,
}

impl IngestEngineBuilder {
    pub fn importers(mut self, importers: ImporterRegistry) -> Self {
        self.importers = importers;
        self
    }

    pub fn sources(mut self, sources: SourceRegistry) -> Self {
        self.sources = sources;
        self
    }

    pub fn store(mut self, store: Arc<dyn EntityStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn repository(mut self, repository: Arc<dyn RunRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn settings(mut self, settings: IngestSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Result<IngestEngine> {
        self.settings.validate()?;

        let repository = self
            .repository
            .unwrap_or_else(|| Arc::new(InMemoryRunRepository::new()));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryEntityStore::new()));

        tracing::debug!(
            importers = self.importers.len(),
            max_concurrent_chunks = self.settings.max_concurrent_chunks,
            rendering = %self.settings.error_rendering,
            "Building ingest engine"
        );

        let orchestrator = Arc::new(ChunkOrchestrator::new(
            Arc::new(self.importers),
            Arc::new(self.sources),
            store,
            repository.clone(),
            self.settings,
        ));

        Ok(IngestEngine {
            retries: RetryCoordinator::new(orchestrator.clone()),
            analyzer: ErrorAnalyzer::new(repository),
            orchestrator,
        })
    }
}

impl IngestEngine {
    pub fn builder() -> IngestEngineBuilder {
        IngestEngineBuilder::default()
    }

    /// Engine backed by Postgres for both runs and target entities
    pub fn postgres(
        pool: PgPool,
        importers: ImporterRegistry,
        sources: SourceRegistry,
        settings: IngestSettings,
    ) -> Result<Self> {
        let pool = Arc::new(pool);
        Self::builder()
            .importers(importers)
            .sources(sources)
            .store(Arc::new(PgEntityStore::new(pool.clone())))
            .repository(Arc::new(PgRunRepository::new(pool)))
            .settings(settings)
            .build()
    }

    /// Start a run; see [`ChunkOrchestrator::start`]
    pub async fn start(
        &self,
        importer: &str,
        payload: SourcePayload,
        actor: Actor,
        dry_run: bool,
    ) -> Result<RunHandle> {
        self.orchestrator.start(importer, payload, actor, dry_run).await
    }

    /// Retry the failed rows of a terminal run
    pub async fn retry(&self, run_id: Uuid, actor: Actor, dry_run: bool) -> Result<RunHandle> {
        self.retries.retry(run_id, actor, dry_run).await
    }

    pub async fn cancel(&self, run_id: Uuid) -> Result<bool> {
        self.orchestrator.cancel(run_id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.orchestrator.subscribe()
    }

    pub async fn run(&self, run_id: Uuid) -> Result<IngestRun> {
        self.orchestrator.aggregator().run(run_id).await
    }

    /// Finalize a run left in `processing`; no-op when already terminal
    ///
    /// Counts come from the row log unless the importer is known and does
    /// not log rows.
    pub async fn finalize(&self, run_id: Uuid) -> Result<IngestRun> {
        let run = self.run(run_id).await?;
        let recount = self
            .orchestrator
            .importers()
            .get(&run.importer)
            .map(|config| config.log_rows)
            .unwrap_or(true);
        self.orchestrator.aggregator().finalize(run_id, recount).await
    }

    pub async fn analyze_errors(&self, run_id: Uuid, limit: Option<usize>) -> Result<ErrorAnalysis> {
        self.analyzer.analyze(run_id, limit).await
    }

    pub fn importers(&self) -> &ImporterRegistry {
        self.orchestrator.importers()
    }
}
