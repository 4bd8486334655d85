//! Error types for the ingestion engine
//!
//! Row-level problems are data ([`RowError`](crate::types::RowError)), not
//! errors. Everything here either aborts a run, rejects a configuration, or is
//! surfaced to the caller of a retry.

use thiserror::Error;
use uuid::Uuid;

use crate::types::RunStatus;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Importer configuration problems, raised before any run exists
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Importer id cannot be empty")]
    EmptyImporter,

    #[error("Importer '{0}' is already registered")]
    DuplicateImporter(String),

    #[error("Chunk size must be greater than 0")]
    ZeroChunkSize,

    #[error("Invalid identifier '{0}': expected letters, digits and underscores")]
    InvalidIdentifier(String),

    #[error("Field mapping for '{0}' has an empty source or target")]
    EmptyMapping(String),

    #[error("Unknown transform '{name}' on field '{field}'")]
    UnknownTransform { field: String, name: String },

    #[error("Invalid relation on field '{field}': {reason}")]
    InvalidRelation { field: String, reason: String },

    #[error("Duplicate key attribute '{0}' is not the target of any field mapping")]
    UnmappedDuplicateKey(String),

    #[error("Invalid validation rule on field '{field}': {reason}")]
    InvalidRule { field: String, reason: String },

    #[error("Invalid setting {name}: {reason}")]
    InvalidSetting { name: String, reason: String },
}

/// Problems reading rows from a source
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Missing required source option '{0}'")]
    MissingOption(String),

    #[error("Source is unreadable: {0}")]
    Unreadable(String),

    #[error("Required key column '{0}' was not found in the source header")]
    MissingKeyColumn(String),

    #[error("Malformed row {row}: {reason}")]
    MalformedRow { row: u64, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Row log unavailable: {0}")]
    RowLog(#[from] RepositoryError),
}

/// Failures of the target-entity persistence collaborator
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Duplicate entry: {attribute} '{value}' already exists")]
    Conflict { attribute: String, value: String },

    #[error("Duplicate entry on {entity}: {constraint}")]
    UniqueViolation { entity: String, constraint: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: String, id: String },

    #[error("Unsafe identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("Unknown entity '{0}'")]
    UnknownEntity(String),
}

/// Failures of the run / row-log repository
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Run {0} not found")]
    RunNotFound(Uuid),

    #[error("Run {0} has no failed rows to retry")]
    NoFailedRows(Uuid),

    #[error("Run {original} already has an active retry ({active})")]
    ActiveRetry { original: Uuid, active: Uuid },

    #[error("Run {run_id} cannot move from {from} to {to}")]
    InvalidTransition {
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("Invalid stored value: {0}")]
    Decode(String),
}

/// Top-level engine error
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Chunk {chunk} of run {run_id} aborted at row {row_number}: {message}")]
    ChunkFatal {
        run_id: Uuid,
        chunk: usize,
        row_number: u64,
        message: String,
    },

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Repository error: {0}")]
    Repository(RepositoryError),

    #[error("Unknown importer '{0}'")]
    UnknownImporter(String),

    #[error("No source registered for type '{0}'")]
    UnknownSourceType(String),

    #[error("Run {0} not found")]
    RunNotFound(Uuid),

    #[error("Run {0} has no failed rows to retry")]
    NoFailedRows(Uuid),

    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("Worker task failed: {0}")]
    Worker(String),
}

impl From<RepositoryError> for IngestError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::RunNotFound(id) => IngestError::RunNotFound(id),
            RepositoryError::NoFailedRows(id) => IngestError::NoFailedRows(id),
            RepositoryError::ActiveRetry { original, active } => IngestError::ConcurrencyConflict(
                format!("run {original} already has an active retry ({active})"),
            ),
            other => IngestError::Repository(other),
        }
    }
}

/// Coarse classification used by callers deciding how to react
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Source,
    ChunkFatal,
    Concurrency,
    Storage,
    NotFound,
}

impl IngestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::Config(_) | IngestError::UnknownImporter(_) => ErrorKind::Configuration,
            IngestError::Source(_) | IngestError::UnknownSourceType(_) => ErrorKind::Source,
            IngestError::ChunkFatal { .. } | IngestError::Worker(_) => ErrorKind::ChunkFatal,
            IngestError::NoFailedRows(_) | IngestError::ConcurrencyConflict(_) => {
                ErrorKind::Concurrency
            },
            IngestError::RunNotFound(_) => ErrorKind::NotFound,
            IngestError::Store(_) | IngestError::Repository(_) => ErrorKind::Storage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_retry_maps_to_concurrency_conflict() {
        let original = Uuid::new_v4();
        let active = Uuid::new_v4();
        let err: IngestError = RepositoryError::ActiveRetry { original, active }.into();

        assert!(matches!(err, IngestError::ConcurrencyConflict(_)));
        assert_eq!(err.kind(), ErrorKind::Concurrency);
        assert!(err.to_string().contains(&active.to_string()));
    }

    #[test]
    fn test_no_failed_rows_keeps_its_identity() {
        let id = Uuid::new_v4();
        let err: IngestError = RepositoryError::NoFailedRows(id).into();
        assert!(matches!(err, IngestError::NoFailedRows(got) if got == id));
    }

    #[test]
    fn test_source_error_kind() {
        let err: IngestError = SourceError::MissingKeyColumn("sku".into()).into();
        assert_eq!(err.kind(), ErrorKind::Source);
        assert_eq!(
            err.to_string(),
            "Source error: Required key column 'sku' was not found in the source header"
        );
    }
}
