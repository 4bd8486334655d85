//! Core types for ingestion runs and the row log

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One source row: column name -> raw value
pub type RowData = Map<String, Value>;

/// Attribute set written to a target entity
pub type Attributes = Map<String, Value>;

/// Ingestion run status
///
/// `pending -> processing -> {completed, completed_with_errors, failed}`.
/// A pending run may also fail directly (e.g. its source never opened).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Processing,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Processing => "processing",
            RunStatus::Completed => "completed",
            RunStatus::CompletedWithErrors => "completed_with_errors",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::CompletedWithErrors | RunStatus::Failed
        )
    }

    /// Monotonic transition check
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (RunStatus::Pending, RunStatus::Processing) => true,
            (RunStatus::Processing, RunStatus::Processing) => true,
            (RunStatus::Pending | RunStatus::Processing, RunStatus::Failed) => true,
            (RunStatus::Processing, RunStatus::Completed | RunStatus::CompletedWithErrors) => {
                true
            },
            _ => false,
        }
    }

    pub const ACTIVE: [RunStatus; 2] = [RunStatus::Pending, RunStatus::Processing];
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "processing" => Ok(RunStatus::Processing),
            "completed" => Ok(RunStatus::Completed),
            "completed_with_errors" => Ok(RunStatus::CompletedWithErrors),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

/// Row log status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Success,
    Failed,
}

impl RowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowStatus::Success => "success",
            RowStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for RowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(RowStatus::Success),
            "failed" => Ok(RowStatus::Failed),
            other => Err(format!("unknown row status '{other}'")),
        }
    }
}

/// Who triggered a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: Option<Uuid>,
}

impl Actor {
    pub fn system() -> Self {
        Self { user_id: None }
    }

    pub fn user(user_id: Uuid) -> Self {
        Self {
            user_id: Some(user_id),
        }
    }
}

/// Ingestion run (maps to ingest_runs table)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRun {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub retried_from_run_id: Option<Uuid>,
    pub importer: String,
    pub user_id: Option<Uuid>,
    pub status: RunStatus,
    pub batch_id: Option<String>,
    pub original_filename: Option<String>,
    pub processed_filepath: Option<String>,
    pub total_rows: Option<i64>,
    pub processed_rows: i64,
    pub successful_rows: i64,
    pub failed_rows: i64,
    pub summary: Value,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IngestRun {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Failure reason recorded by the orchestrator
    pub fn error(&self) -> Option<&str> {
        self.summary.get("error").and_then(Value::as_str)
    }

    pub fn is_dry_run(&self) -> bool {
        self.summary
            .get("dry_run")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn progress(&self) -> RunProgress {
        RunProgress {
            status: self.status,
            total_rows: self.total_rows,
            processed_rows: self.processed_rows,
            successful_rows: self.successful_rows,
            failed_rows: self.failed_rows,
        }
    }
}

/// Parameters for creating a run
#[derive(Debug, Clone)]
pub struct CreateRunParams {
    pub importer: String,
    pub user_id: Option<Uuid>,
    pub status: RunStatus,
    pub parent_id: Option<Uuid>,
    pub retried_from_run_id: Option<Uuid>,
    pub original_filename: Option<String>,
    pub total_rows: Option<i64>,
    pub summary: Value,
}

impl CreateRunParams {
    pub fn new(importer: impl Into<String>, actor: Actor) -> Self {
        Self {
            importer: importer.into(),
            user_id: actor.user_id,
            status: RunStatus::Processing,
            parent_id: None,
            retried_from_run_id: None,
            original_filename: None,
            total_rows: None,
            summary: Value::Object(Map::new()),
        }
    }

    /// Pending retry of `original`, expecting `total_rows` failed rows
    pub fn retry_of(original: &IngestRun, actor: Actor) -> Self {
        Self {
            importer: original.importer.clone(),
            user_id: actor.user_id,
            status: RunStatus::Pending,
            parent_id: Some(original.id),
            retried_from_run_id: Some(original.id),
            original_filename: original.original_filename.clone(),
            total_rows: Some(original.failed_rows),
            summary: Value::Object(Map::new()),
        }
    }
}

/// Source facts recorded once the rows have been read
#[derive(Debug, Clone, Default)]
pub struct RunStart {
    pub batch_id: Option<String>,
    pub total_rows: Option<i64>,
    pub processed_filepath: Option<String>,
}

/// Run progress snapshot
#[derive(Debug, Clone, Serialize)]
pub struct RunProgress {
    pub status: RunStatus,
    pub total_rows: Option<i64>,
    pub processed_rows: i64,
    pub successful_rows: i64,
    pub failed_rows: i64,
}

impl RunProgress {
    /// Completion percentage, `None` while the total is unknown
    pub fn completion_percentage(&self) -> Option<f64> {
        match self.total_rows {
            Some(0) => Some(100.0),
            Some(total) => Some((self.processed_rows as f64 / total as f64) * 100.0),
            None => None,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.processed_rows == 0 {
            return 0.0;
        }
        (self.successful_rows as f64 / self.processed_rows as f64) * 100.0
    }
}

/// Structured failure detail stored in `ingest_rows.errors`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, Vec<String>>,
}

impl RowError {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Summarise per-field messages as "first message (and N more errors)"
    pub fn validation(fields: BTreeMap<String, Vec<String>>) -> Self {
        let total: usize = fields.values().map(Vec::len).sum();
        let first = fields
            .values()
            .flat_map(|messages| messages.iter())
            .next()
            .cloned()
            .unwrap_or_else(|| "The given data was invalid.".to_string());

        let message = match total {
            0 | 1 => first,
            2 => format!("{first} (and 1 more error)"),
            n => format!("{first} (and {} more errors)", n - 1),
        };

        Self { message, fields }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::String(self.message.clone()))
    }
}

/// Row log entry (maps to ingest_rows table)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRow {
    pub id: i64,
    pub ingest_run_id: Uuid,
    pub row_number: i64,
    pub status: RowStatus,
    pub data: RowData,
    pub errors: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Row log entry queued for the end-of-chunk batch insert
#[derive(Debug, Clone)]
pub struct NewIngestRow {
    pub row_number: i64,
    pub status: RowStatus,
    pub data: RowData,
    pub errors: Option<RowError>,
}

/// Persisted row-log counts for one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowCounts {
    pub successful: i64,
    pub failed: i64,
}

impl RowCounts {
    pub fn total(&self) -> i64 {
        self.successful + self.failed
    }
}

/// Null, empty or whitespace-only strings count as blank
pub(crate) fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Scalar text form used for key matching and rule checks
pub(crate) fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
