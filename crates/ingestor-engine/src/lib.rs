//! Ingestor Engine Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Chunked, concurrent ingestion of tabular rows into target entities.
//!
//! # Overview
//!
//! - **Importers**: declarative [`IngestConfig`] definitions (field mappings,
//!   transforms, relations, validation, duplicate policy), validated when
//!   registered
//! - **Sources**: pluggable row producers behind [`RowSource`]
//! - **Pipeline**: chunking, bounded parallel dispatch, per-row processing
//!   and run aggregation
//! - **Persistence**: run/row-log repository and target-entity store, each
//!   with a Postgres (SQLx) and an in-memory implementation
//! - **Retry & analysis**: replaying a run's failed rows and aggregating its
//!   failure reasons
//!
//! # Run lifecycle
//!
//! `pending -> processing -> {completed, completed_with_errors, failed}`.
//! Row-level failures produce `completed_with_errors`; only pipeline-level
//! errors (source, chunk transaction abort, cancellation) produce `failed`.
//!
//! # Example
//!
//! ```no_run
//! use ingestor_engine::{
//!     Actor, FieldMapping, ImporterRegistry, IngestConfig, IngestEngine, SourcePayload,
//!     TargetEntity,
//! };
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut importers = ImporterRegistry::default();
//!     importers.register(
//!         IngestConfig::builder("products", "memory", TargetEntity::new("products"))
//!             .field(FieldMapping::new("SKU", "sku"))
//!             .build(),
//!     )?;
//!
//!     let engine = IngestEngine::builder().importers(importers).build()?;
//!     let payload = SourcePayload::new("products.json")
//!         .option("rows", json!([{ "SKU": "A-1" }]));
//!     let run = engine
//!         .start("products", payload, Actor::system(), false)
//!         .await?
//!         .wait()
//!         .await?;
//!     tracing::info!(status = %run.status, "Import finished");
//!     Ok(())
//! }
//! ```

pub mod analysis;
pub mod config;
pub mod engine;
pub mod error;
pub mod importer;
pub mod pipeline;
pub mod repository;
pub mod source;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use analysis::{ErrorAnalysis, ErrorAnalyzer, ErrorCount};
pub use config::{EngineConfig, IngestSettings};
pub use engine::{IngestEngine, IngestEngineBuilder};
pub use error::{ErrorKind, IngestError, Result};
pub use importer::{
    DuplicateStrategy, FieldMapping, ImporterRegistry, IngestConfig, RelationRule, TargetEntity,
    TransactionMode, TransformRegistry, ValidationRule,
};
pub use pipeline::{RunEvent, RunHandle};
pub use source::{RowSource, SourcePayload, SourceRegistry};
pub use store::{EntityStore, InMemoryEntityStore};
pub use repository::{InMemoryRunRepository, RunRepository};
pub use types::{Actor, IngestRow, IngestRun, RowError, RowStatus, RunStatus};
