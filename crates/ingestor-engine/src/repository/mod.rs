//! Run and row-log persistence
//!
//! The repository is the only place where run counters and status change.
//! Every mutation of a run happens under an exclusive per-run lock so that
//! concurrently completing chunks never lose an increment.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryRunRepository;
pub use postgres::PgRunRepository;

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::RepositoryError;
use crate::types::{Actor, CreateRunParams, IngestRow, IngestRun, NewIngestRow, RowCounts, RunStart};

/// Default page size when streaming failed rows
pub const DEFAULT_FAILED_ROW_PAGE: i64 = 500;

/// Per-chunk counter delta
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub processed: i64,
    pub successful: i64,
    pub failed: i64,
}

/// Repository for ingestion runs and their row log
#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Insert a new run
    async fn create_run(&self, params: CreateRunParams) -> Result<IngestRun, RepositoryError>;

    async fn get_run(&self, run_id: Uuid) -> Result<IngestRun, RepositoryError>;

    /// Move a run to `processing` and record the source facts
    async fn mark_processing(
        &self,
        run_id: Uuid,
        start: RunStart,
    ) -> Result<IngestRun, RepositoryError>;

    /// Shallow-merge `patch` into the run summary
    async fn merge_summary(
        &self,
        run_id: Uuid,
        patch: Map<String, Value>,
    ) -> Result<IngestRun, RepositoryError>;

    /// Add a chunk tally to the run counters under the run lock
    ///
    /// Additive and commutative. A terminal run is returned unchanged.
    async fn increment_counters(
        &self,
        run_id: Uuid,
        delta: CounterDelta,
    ) -> Result<IngestRun, RepositoryError>;

    /// Move a processing run to its completed state
    ///
    /// With `recount`, totals are recomputed from the row log instead of the
    /// running counters. `total_rows` becomes the processed count. A terminal
    /// run is returned unchanged.
    async fn finalize_run(&self, run_id: Uuid, recount: bool)
        -> Result<IngestRun, RepositoryError>;

    /// Mark a run `failed` with `error` in its summary; no-op when terminal
    async fn fail_run(
        &self,
        run_id: Uuid,
        error: &str,
        patch: Map<String, Value>,
    ) -> Result<IngestRun, RepositoryError>;

    /// Batch-insert row log entries; rows already logged for the run are
    /// ignored. Returns the number of rows written.
    async fn insert_rows(
        &self,
        run_id: Uuid,
        rows: &[NewIngestRow],
    ) -> Result<u64, RepositoryError>;

    /// Failed rows with `row_number > after`, ascending, at most `limit`
    async fn failed_rows(
        &self,
        run_id: Uuid,
        after: i64,
        limit: i64,
    ) -> Result<Vec<IngestRow>, RepositoryError>;

    async fn row_status_counts(&self, run_id: Uuid) -> Result<RowCounts, RepositoryError>;

    /// Create a pending retry of `original_id` under a lock on the original
    ///
    /// Fails with `NoFailedRows` when the original has nothing to retry and
    /// with `ActiveRetry` while another retry of it is still active.
    async fn create_retry_run(
        &self,
        original_id: Uuid,
        actor: Actor,
        summary: Map<String, Value>,
    ) -> Result<IngestRun, RepositoryError>;
}
