//! PostgreSQL run repository
//!
//! Every run mutation locks the run row with `SELECT ... FOR UPDATE` inside a
//! transaction. Row log batches go out as one `UNNEST` insert per chunk.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use uuid::Uuid;

use super::{CounterDelta, RunRepository};
use crate::error::RepositoryError;
use crate::types::{
    Actor, CreateRunParams, IngestRow, IngestRun, NewIngestRow, RowCounts, RowData, RunStart,
    RunStatus,
};

const RUN_COLUMNS: &str = "id, parent_id, retried_from_run_id, importer, user_id, status, \
     batch_id, original_filename, processed_filepath, total_rows, processed_rows, \
     successful_rows, failed_rows, summary, completed_at, created_at, updated_at";

const ACTIVE_RETRY_INDEX: &str = "uq_ingest_runs_active_retry";

#[derive(sqlx::FromRow)]
struct RunRecord {
    id: Uuid,
    parent_id: Option<Uuid>,
    retried_from_run_id: Option<Uuid>,
    importer: String,
    user_id: Option<Uuid>,
    status: String,
    batch_id: Option<String>,
    original_filename: Option<String>,
    processed_filepath: Option<String>,
    total_rows: Option<i64>,
    processed_rows: i64,
    successful_rows: i64,
    failed_rows: i64,
    summary: Value,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RunRecord> for IngestRun {
    type Error = RepositoryError;

    fn try_from(record: RunRecord) -> Result<Self, Self::Error> {
        Ok(IngestRun {
            id: record.id,
            parent_id: record.parent_id,
            retried_from_run_id: record.retried_from_run_id,
            importer: record.importer,
            user_id: record.user_id,
            status: record.status.parse().map_err(RepositoryError::Decode)?,
            batch_id: record.batch_id,
            original_filename: record.original_filename,
            processed_filepath: record.processed_filepath,
            total_rows: record.total_rows,
            processed_rows: record.processed_rows,
            successful_rows: record.successful_rows,
            failed_rows: record.failed_rows,
            summary: record.summary,
            completed_at: record.completed_at,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RowRecord {
    id: i64,
    ingest_run_id: Uuid,
    row_number: i64,
    status: String,
    data: sqlx::types::Json<RowData>,
    errors: Option<Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RowRecord> for IngestRow {
    type Error = RepositoryError;

    fn try_from(record: RowRecord) -> Result<Self, Self::Error> {
        Ok(IngestRow {
            id: record.id,
            ingest_run_id: record.ingest_run_id,
            row_number: record.row_number,
            status: record.status.parse().map_err(RepositoryError::Decode)?,
            data: record.data.0,
            errors: record.errors,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

fn is_active_retry_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.constraint() == Some(ACTIVE_RETRY_INDEX))
}

/// Run repository backed by PostgreSQL
#[derive(Clone)]
pub struct PgRunRepository {
    pool: Arc<PgPool>,
}

impl PgRunRepository {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<(), RepositoryError> {
        sqlx::migrate!("./migrations").run(&*self.pool).await?;
        Ok(())
    }

    async fn lock_run(
        tx: &mut Transaction<'_, Postgres>,
        run_id: Uuid,
    ) -> Result<IngestRun, RepositoryError> {
        let record: Option<RunRecord> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM ingest_runs WHERE id = $1 FOR UPDATE"
        ))
        .bind(run_id)
        .fetch_optional(&mut **tx)
        .await?;

        record
            .ok_or(RepositoryError::RunNotFound(run_id))?
            .try_into()
    }

    async fn count_rows(
        tx: &mut Transaction<'_, Postgres>,
        run_id: Uuid,
    ) -> Result<RowCounts, RepositoryError> {
        let (successful, failed): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FILTER (WHERE status = 'success'),
                   COUNT(*) FILTER (WHERE status = 'failed')
            FROM ingest_rows
            WHERE ingest_run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_one(&mut **tx)
        .await?;

        Ok(RowCounts { successful, failed })
    }

    async fn insert_run(
        tx: &mut Transaction<'_, Postgres>,
        params: CreateRunParams,
    ) -> Result<IngestRun, sqlx::Error> {
        let record: RunRecord = sqlx::query_as(&format!(
            r#"
            INSERT INTO ingest_runs (
                id, parent_id, retried_from_run_id, importer, user_id, status,
                original_filename, total_rows, summary
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(params.parent_id)
        .bind(params.retried_from_run_id)
        .bind(&params.importer)
        .bind(params.user_id)
        .bind(params.status.as_str())
        .bind(&params.original_filename)
        .bind(params.total_rows)
        .bind(&params.summary)
        .fetch_one(&mut **tx)
        .await?;

        IngestRun::try_from(record).map_err(|e| sqlx::Error::Decode(Box::new(e)))
    }
}

#[async_trait]
impl RunRepository for PgRunRepository {
    async fn create_run(&self, params: CreateRunParams) -> Result<IngestRun, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let run = Self::insert_run(&mut tx, params).await?;
        tx.commit().await?;
        Ok(run)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<IngestRun, RepositoryError> {
        let record: Option<RunRecord> =
            sqlx::query_as(&format!("SELECT {RUN_COLUMNS} FROM ingest_runs WHERE id = $1"))
                .bind(run_id)
                .fetch_optional(&*self.pool)
                .await?;

        record
            .ok_or(RepositoryError::RunNotFound(run_id))?
            .try_into()
    }

    async fn mark_processing(
        &self,
        run_id: Uuid,
        start: RunStart,
    ) -> Result<IngestRun, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let run = Self::lock_run(&mut tx, run_id).await?;
        if !run.status.can_transition_to(RunStatus::Processing) {
            return Err(RepositoryError::InvalidTransition {
                run_id,
                from: run.status,
                to: RunStatus::Processing,
            });
        }

        let record: RunRecord = sqlx::query_as(&format!(
            r#"
            UPDATE ingest_runs
            SET status = 'processing',
                batch_id = COALESCE($2, batch_id),
                total_rows = COALESCE($3, total_rows),
                processed_filepath = COALESCE($4, processed_filepath),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run_id)
        .bind(&start.batch_id)
        .bind(start.total_rows)
        .bind(&start.processed_filepath)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        record.try_into()
    }

    async fn merge_summary(
        &self,
        run_id: Uuid,
        patch: Map<String, Value>,
    ) -> Result<IngestRun, RepositoryError> {
        let record: Option<RunRecord> = sqlx::query_as(&format!(
            r#"
            UPDATE ingest_runs
            SET summary = COALESCE(summary, '{{}}'::jsonb) || $2, updated_at = NOW()
            WHERE id = $1
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run_id)
        .bind(Value::Object(patch))
        .fetch_optional(&*self.pool)
        .await?;

        record
            .ok_or(RepositoryError::RunNotFound(run_id))?
            .try_into()
    }

    async fn increment_counters(
        &self,
        run_id: Uuid,
        delta: CounterDelta,
    ) -> Result<IngestRun, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let run = Self::lock_run(&mut tx, run_id).await?;
        if run.is_terminal() {
            tx.rollback().await?;
            return Ok(run);
        }

        let record: RunRecord = sqlx::query_as(&format!(
            r#"
            UPDATE ingest_runs
            SET processed_rows = processed_rows + $2,
                successful_rows = successful_rows + $3,
                failed_rows = failed_rows + $4,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run_id)
        .bind(delta.processed)
        .bind(delta.successful)
        .bind(delta.failed)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        record.try_into()
    }

    async fn finalize_run(
        &self,
        run_id: Uuid,
        recount: bool,
    ) -> Result<IngestRun, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let run = Self::lock_run(&mut tx, run_id).await?;
        if run.is_terminal() {
            tx.rollback().await?;
            return Ok(run);
        }
        if run.status != RunStatus::Processing {
            return Err(RepositoryError::InvalidTransition {
                run_id,
                from: run.status,
                to: RunStatus::Completed,
            });
        }

        let counts = if recount {
            Self::count_rows(&mut tx, run_id).await?
        } else {
            RowCounts {
                successful: run.successful_rows,
                failed: run.failed_rows,
            }
        };
        let status = if counts.failed == 0 {
            RunStatus::Completed
        } else {
            RunStatus::CompletedWithErrors
        };

        let record: RunRecord = sqlx::query_as(&format!(
            r#"
            UPDATE ingest_runs
            SET status = $2,
                total_rows = $3,
                processed_rows = $3,
                successful_rows = $4,
                failed_rows = $5,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run_id)
        .bind(status.as_str())
        .bind(counts.total())
        .bind(counts.successful)
        .bind(counts.failed)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        record.try_into()
    }

    async fn fail_run(
        &self,
        run_id: Uuid,
        error: &str,
        mut patch: Map<String, Value>,
    ) -> Result<IngestRun, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let run = Self::lock_run(&mut tx, run_id).await?;
        if run.is_terminal() {
            tx.rollback().await?;
            return Ok(run);
        }

        patch.insert("error".to_string(), Value::String(error.to_string()));
        let record: RunRecord = sqlx::query_as(&format!(
            r#"
            UPDATE ingest_runs
            SET status = 'failed',
                summary = COALESCE(summary, '{{}}'::jsonb) || $2,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run_id)
        .bind(Value::Object(patch))
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        record.try_into()
    }

    async fn insert_rows(
        &self,
        run_id: Uuid,
        rows: &[NewIngestRow],
    ) -> Result<u64, RepositoryError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut numbers = Vec::with_capacity(rows.len());
        let mut statuses = Vec::with_capacity(rows.len());
        let mut data = Vec::with_capacity(rows.len());
        let mut errors = Vec::with_capacity(rows.len());
        for row in rows {
            numbers.push(row.row_number);
            statuses.push(row.status.as_str().to_string());
            data.push(Value::Object(row.data.clone()));
            errors.push(row.errors.as_ref().map(|e| e.to_value()));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO ingest_rows (ingest_run_id, row_number, status, data, errors)
            SELECT $1, r.row_number, r.status, r.data, r.errors
            FROM UNNEST($2::bigint[], $3::text[], $4::jsonb[], $5::jsonb[])
                AS r(row_number, status, data, errors)
            ON CONFLICT (ingest_run_id, row_number) DO NOTHING
            "#,
        )
        .bind(run_id)
        .bind(&numbers)
        .bind(&statuses)
        .bind(&data)
        .bind(&errors)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn failed_rows(
        &self,
        run_id: Uuid,
        after: i64,
        limit: i64,
    ) -> Result<Vec<IngestRow>, RepositoryError> {
        let records: Vec<RowRecord> = sqlx::query_as(
            r#"
            SELECT id, ingest_run_id, row_number, status, data, errors, created_at, updated_at
            FROM ingest_rows
            WHERE ingest_run_id = $1 AND status = 'failed' AND row_number > $2
            ORDER BY row_number
            LIMIT $3
            "#,
        )
        .bind(run_id)
        .bind(after)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        records.into_iter().map(IngestRow::try_from).collect()
    }

    async fn row_status_counts(&self, run_id: Uuid) -> Result<RowCounts, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let counts = Self::count_rows(&mut tx, run_id).await?;
        tx.commit().await?;
        Ok(counts)
    }

    async fn create_retry_run(
        &self,
        original_id: Uuid,
        actor: Actor,
        summary: Map<String, Value>,
    ) -> Result<IngestRun, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let original = Self::lock_run(&mut tx, original_id).await?;

        let logged_failures: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM ingest_rows WHERE ingest_run_id = $1 AND status = 'failed')",
        )
        .bind(original_id)
        .fetch_one(&mut *tx)
        .await?;
        if original.failed_rows == 0 || !logged_failures {
            return Err(RepositoryError::NoFailedRows(original_id));
        }

        let active: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM ingest_runs
            WHERE retried_from_run_id = $1 AND status IN ('pending', 'processing')
            LIMIT 1
            "#,
        )
        .bind(original_id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(active) = active {
            return Err(RepositoryError::ActiveRetry {
                original: original_id,
                active,
            });
        }

        let mut params = CreateRunParams::retry_of(&original, actor);
        params.summary = Value::Object(summary);
        let retry = match Self::insert_run(&mut tx, params).await {
            Ok(run) => run,
            Err(err) if is_active_retry_violation(&err) => {
                return Err(RepositoryError::ActiveRetry {
                    original: original_id,
                    active: Uuid::nil(),
                });
            },
            Err(err) => return Err(err.into()),
        };

        tx.commit().await?;
        Ok(retry)
    }
}
