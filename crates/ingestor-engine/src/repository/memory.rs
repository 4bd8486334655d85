//! In-memory run repository
//!
//! A single tokio mutex guards all runs, which subsumes the per-run lock.
//! Used by tests and by embedders that do not need durable run history.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{CounterDelta, RunRepository};
use crate::error::RepositoryError;
use crate::types::{
    Actor, CreateRunParams, IngestRow, IngestRun, NewIngestRow, RowCounts, RowStatus, RunStart,
    RunStatus,
};

#[derive(Default)]
struct State {
    runs: HashMap<Uuid, IngestRun>,
    rows: HashMap<Uuid, BTreeMap<i64, IngestRow>>,
    next_row_id: i64,
}

impl State {
    fn run_mut(&mut self, run_id: Uuid) -> Result<&mut IngestRun, RepositoryError> {
        self.runs
            .get_mut(&run_id)
            .ok_or(RepositoryError::RunNotFound(run_id))
    }

    fn counts(&self, run_id: Uuid) -> RowCounts {
        let mut counts = RowCounts::default();
        for row in self.rows.get(&run_id).into_iter().flat_map(BTreeMap::values) {
            match row.status {
                RowStatus::Success => counts.successful += 1,
                RowStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    fn insert_run(&mut self, params: CreateRunParams) -> IngestRun {
        let now = Utc::now();
        let run = IngestRun {
            id: Uuid::new_v4(),
            parent_id: params.parent_id,
            retried_from_run_id: params.retried_from_run_id,
            importer: params.importer,
            user_id: params.user_id,
            status: params.status,
            batch_id: None,
            original_filename: params.original_filename,
            processed_filepath: None,
            total_rows: params.total_rows,
            processed_rows: 0,
            successful_rows: 0,
            failed_rows: 0,
            summary: params.summary,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        self.runs.insert(run.id, run.clone());
        run
    }
}

fn merge(summary: &mut Value, patch: Map<String, Value>) {
    if !summary.is_object() {
        *summary = Value::Object(Map::new());
    }
    if let Value::Object(map) = summary {
        map.extend(patch);
    }
}

/// Run repository held entirely in memory
#[derive(Default)]
pub struct InMemoryRunRepository {
    state: Mutex<State>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// All row log entries of a run, ascending by row number
    pub async fn rows(&self, run_id: Uuid) -> Vec<IngestRow> {
        let state = self.state.lock().await;
        state
            .rows
            .get(&run_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Runs whose retry source is `original_id`
    pub async fn retries_of(&self, original_id: Uuid) -> Vec<IngestRun> {
        let state = self.state.lock().await;
        state
            .runs
            .values()
            .filter(|run| run.retried_from_run_id == Some(original_id))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RunRepository for InMemoryRunRepository {
    async fn create_run(&self, params: CreateRunParams) -> Result<IngestRun, RepositoryError> {
        let mut state = self.state.lock().await;
        Ok(state.insert_run(params))
    }

    async fn get_run(&self, run_id: Uuid) -> Result<IngestRun, RepositoryError> {
        let state = self.state.lock().await;
        state
            .runs
            .get(&run_id)
            .cloned()
            .ok_or(RepositoryError::RunNotFound(run_id))
    }

    async fn mark_processing(
        &self,
        run_id: Uuid,
        start: RunStart,
    ) -> Result<IngestRun, RepositoryError> {
        let mut state = self.state.lock().await;
        let run = state.run_mut(run_id)?;
        if !run.status.can_transition_to(RunStatus::Processing) {
            return Err(RepositoryError::InvalidTransition {
                run_id,
                from: run.status,
                to: RunStatus::Processing,
            });
        }
        run.status = RunStatus::Processing;
        run.batch_id = start.batch_id.or(run.batch_id.take());
        run.total_rows = start.total_rows.or(run.total_rows);
        run.processed_filepath = start.processed_filepath.or(run.processed_filepath.take());
        run.updated_at = Utc::now();
        Ok(run.clone())
    }

    async fn merge_summary(
        &self,
        run_id: Uuid,
        patch: Map<String, Value>,
    ) -> Result<IngestRun, RepositoryError> {
        let mut state = self.state.lock().await;
        let run = state.run_mut(run_id)?;
        merge(&mut run.summary, patch);
        run.updated_at = Utc::now();
        Ok(run.clone())
    }

    async fn increment_counters(
        &self,
        run_id: Uuid,
        delta: CounterDelta,
    ) -> Result<IngestRun, RepositoryError> {
        let mut state = self.state.lock().await;
        let run = state.run_mut(run_id)?;
        if run.is_terminal() {
            return Ok(run.clone());
        }
        run.processed_rows += delta.processed;
        run.successful_rows += delta.successful;
        run.failed_rows += delta.failed;
        run.updated_at = Utc::now();
        Ok(run.clone())
    }

    async fn finalize_run(
        &self,
        run_id: Uuid,
        recount: bool,
    ) -> Result<IngestRun, RepositoryError> {
        let mut state = self.state.lock().await;
        let counts = state.counts(run_id);
        let run = state.run_mut(run_id)?;
        if run.is_terminal() {
            return Ok(run.clone());
        }
        if run.status != RunStatus::Processing {
            return Err(RepositoryError::InvalidTransition {
                run_id,
                from: run.status,
                to: RunStatus::Completed,
            });
        }

        if recount {
            run.successful_rows = counts.successful;
            run.failed_rows = counts.failed;
        }
        run.processed_rows = run.successful_rows + run.failed_rows;
        run.total_rows = Some(run.processed_rows);
        run.status = if run.failed_rows == 0 {
            RunStatus::Completed
        } else {
            RunStatus::CompletedWithErrors
        };
        let now = Utc::now();
        run.completed_at = Some(now);
        run.updated_at = now;
        Ok(run.clone())
    }

    async fn fail_run(
        &self,
        run_id: Uuid,
        error: &str,
        mut patch: Map<String, Value>,
    ) -> Result<IngestRun, RepositoryError> {
        let mut state = self.state.lock().await;
        let run = state.run_mut(run_id)?;
        if run.is_terminal() {
            return Ok(run.clone());
        }
        patch.insert("error".to_string(), Value::String(error.to_string()));
        merge(&mut run.summary, patch);
        run.status = RunStatus::Failed;
        let now = Utc::now();
        run.completed_at = Some(now);
        run.updated_at = now;
        Ok(run.clone())
    }

    async fn insert_rows(
        &self,
        run_id: Uuid,
        rows: &[NewIngestRow],
    ) -> Result<u64, RepositoryError> {
        let mut state = self.state.lock().await;
        if !state.runs.contains_key(&run_id) {
            return Err(RepositoryError::RunNotFound(run_id));
        }

        let now = Utc::now();
        let mut written = 0;
        for row in rows {
            if state
                .rows
                .get(&run_id)
                .is_some_and(|log| log.contains_key(&row.row_number))
            {
                continue;
            }
            state.next_row_id += 1;
            let entry = IngestRow {
                id: state.next_row_id,
                ingest_run_id: run_id,
                row_number: row.row_number,
                status: row.status,
                data: row.data.clone(),
                errors: row.errors.as_ref().map(|e| e.to_value()),
                created_at: now,
                updated_at: now,
            };
            state
                .rows
                .entry(run_id)
                .or_default()
                .insert(row.row_number, entry);
            written += 1;
        }
        Ok(written)
    }

    async fn failed_rows(
        &self,
        run_id: Uuid,
        after: i64,
        limit: i64,
    ) -> Result<Vec<IngestRow>, RepositoryError> {
        let state = self.state.lock().await;
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        Ok(state
            .rows
            .get(&run_id)
            .map(|log| {
                log.range(after.saturating_add(1)..)
                    .map(|(_, row)| row)
                    .filter(|row| row.status == RowStatus::Failed)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn row_status_counts(&self, run_id: Uuid) -> Result<RowCounts, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state.counts(run_id))
    }

    async fn create_retry_run(
        &self,
        original_id: Uuid,
        actor: Actor,
        summary: Map<String, Value>,
    ) -> Result<IngestRun, RepositoryError> {
        let mut state = self.state.lock().await;
        let original = state
            .runs
            .get(&original_id)
            .cloned()
            .ok_or(RepositoryError::RunNotFound(original_id))?;

        if original.failed_rows == 0 || state.counts(original_id).failed == 0 {
            return Err(RepositoryError::NoFailedRows(original_id));
        }
        if let Some(active) = state.runs.values().find(|run| {
            run.retried_from_run_id == Some(original_id) && !run.status.is_terminal()
        }) {
            return Err(RepositoryError::ActiveRetry {
                original: original_id,
                active: active.id,
            });
        }

        let mut params = CreateRunParams::retry_of(&original, actor);
        params.summary = Value::Object(summary);
        Ok(state.insert_run(params))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::RowError;
    use serde_json::json;
    use std::sync::Arc;

    fn logged(row_number: i64, status: RowStatus) -> NewIngestRow {
        NewIngestRow {
            row_number,
            status,
            data: json!({ "n": row_number }).as_object().cloned().unwrap(),
            errors: (status == RowStatus::Failed).then(|| RowError::message("bad row")),
        }
    }

    async fn processing_run(repo: &InMemoryRunRepository) -> IngestRun {
        repo.create_run(CreateRunParams::new("products", Actor::system()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_finalize_recounts_from_row_log() {
        let repo = InMemoryRunRepository::new();
        let run = processing_run(&repo).await;

        repo.insert_rows(
            run.id,
            &[
                logged(1, RowStatus::Success),
                logged(2, RowStatus::Failed),
                logged(3, RowStatus::Success),
            ],
        )
        .await
        .unwrap();
        // Counters deliberately drift from the log
        repo.increment_counters(
            run.id,
            CounterDelta {
                processed: 5,
                successful: 5,
                failed: 0,
            },
        )
        .await
        .unwrap();

        let done = repo.finalize_run(run.id, true).await.unwrap();
        assert_eq!(done.status, RunStatus::CompletedWithErrors);
        assert_eq!((done.processed_rows, done.successful_rows, done.failed_rows), (3, 2, 1));
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_finalize_is_idempotent() {
        let repo = InMemoryRunRepository::new();
        let run = processing_run(&repo).await;

        let first = repo.finalize_run(run.id, true).await.unwrap();
        repo.insert_rows(run.id, &[logged(1, RowStatus::Failed)]).await.unwrap();
        let second = repo.finalize_run(run.id, true).await.unwrap();

        assert_eq!(first.status, RunStatus::Completed);
        assert_eq!(second.status, RunStatus::Completed);
        assert_eq!(second.failed_rows, 0);
        assert_eq!(first.completed_at, second.completed_at);
    }

    #[tokio::test]
    async fn test_duplicate_row_numbers_are_ignored() {
        let repo = InMemoryRunRepository::new();
        let run = processing_run(&repo).await;

        let rows = [logged(1, RowStatus::Success), logged(2, RowStatus::Failed)];
        assert_eq!(repo.insert_rows(run.id, &rows).await.unwrap(), 2);
        assert_eq!(repo.insert_rows(run.id, &rows).await.unwrap(), 0);
        assert_eq!(
            repo.row_status_counts(run.id).await.unwrap(),
            RowCounts {
                successful: 1,
                failed: 1
            }
        );
    }

    #[tokio::test]
    async fn test_failed_rows_keyset_paging() {
        let repo = InMemoryRunRepository::new();
        let run = processing_run(&repo).await;
        let rows: Vec<_> = (1..=10)
            .map(|n| logged(n, if n % 2 == 0 { RowStatus::Failed } else { RowStatus::Success }))
            .collect();
        repo.insert_rows(run.id, &rows).await.unwrap();

        let page = repo.failed_rows(run.id, 0, 3).await.unwrap();
        let numbers: Vec<i64> = page.iter().map(|r| r.row_number).collect();
        assert_eq!(numbers, vec![2, 4, 6]);

        let next = repo.failed_rows(run.id, 6, 3).await.unwrap();
        let numbers: Vec<i64> = next.iter().map(|r| r.row_number).collect();
        assert_eq!(numbers, vec![8, 10]);
    }

    #[tokio::test]
    async fn test_fail_run_ignores_terminal_runs() {
        let repo = InMemoryRunRepository::new();
        let run = processing_run(&repo).await;

        let failed = repo.fail_run(run.id, "source unreadable", Map::new()).await.unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.error(), Some("source unreadable"));

        let again = repo.fail_run(run.id, "other", Map::new()).await.unwrap();
        assert_eq!(again.error(), Some("source unreadable"));
        let finalized = repo.finalize_run(run.id, true).await.unwrap();
        assert_eq!(finalized.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_concurrent_increments_sum_exactly() {
        let repo = Arc::new(InMemoryRunRepository::new());
        let run_id = processing_run(&repo).await.id;

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..50_i64 {
            let repo = repo.clone();
            tasks.spawn(async move {
                repo.increment_counters(
                    run_id,
                    CounterDelta {
                        processed: 3,
                        successful: 3 - i % 2,
                        failed: i % 2,
                    },
                )
                .await
                .unwrap();
            });
        }
        while tasks.join_next().await.is_some() {}

        let run = repo.get_run(run_id).await.unwrap();
        assert_eq!(run.processed_rows, 150);
        assert_eq!(run.failed_rows, 25);
        assert_eq!(run.successful_rows, 125);
    }

    #[tokio::test]
    async fn test_retry_guards() {
        let repo = InMemoryRunRepository::new();
        let clean = processing_run(&repo).await;
        repo.finalize_run(clean.id, true).await.unwrap();
        assert!(matches!(
            repo.create_retry_run(clean.id, Actor::system(), Map::new()).await,
            Err(RepositoryError::NoFailedRows(_))
        ));

        let run = processing_run(&repo).await;
        repo.insert_rows(run.id, &[logged(1, RowStatus::Failed)]).await.unwrap();
        repo.finalize_run(run.id, true).await.unwrap();

        let retry = repo
            .create_retry_run(run.id, Actor::system(), Map::new())
            .await
            .unwrap();
        assert_eq!(retry.status, RunStatus::Pending);
        assert_eq!(retry.parent_id, Some(run.id));
        assert_eq!(retry.total_rows, Some(1));

        assert!(matches!(
            repo.create_retry_run(run.id, Actor::system(), Map::new()).await,
            Err(RepositoryError::ActiveRetry { active, .. }) if active == retry.id
        ));

        repo.fail_run(retry.id, "cancelled", Map::new()).await.unwrap();
        assert!(repo
            .create_retry_run(run.id, Actor::system(), Map::new())
            .await
            .is_ok());
    }
}
