//! Row sources
//!
//! A source turns an ingestion payload into a lazy stream of rows. Concrete
//! file and network readers live outside the engine; they plug in through
//! [`SourceRegistry`] under the `source_type` an importer names.

pub mod failed_rows;
pub mod memory;

pub use failed_rows::FailedRowsSource;
pub use memory::InMemorySource;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{IngestError, SourceError};
use crate::importer::IngestConfig;
use crate::types::RowData;

/// Lazy row stream; not restartable
pub type RowStream = BoxStream<'static, Result<RowData, SourceError>>;

/// Caller-supplied description of what to ingest
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcePayload {
    /// Name shown to users (uploaded file name, URL, ...)
    #[serde(default)]
    pub original_name: Option<String>,
    /// Source-specific options
    #[serde(default)]
    pub options: Map<String, Value>,
}

impl SourcePayload {
    pub fn new(original_name: impl Into<String>) -> Self {
        Self {
            original_name: Some(original_name.into()),
            options: Map::new(),
        }
    }

    pub fn option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    pub fn require(&self, key: &str) -> Result<&Value, SourceError> {
        self.options
            .get(key)
            .ok_or_else(|| SourceError::MissingOption(key.to_string()))
    }
}

/// Producer of rows for one run
#[async_trait]
pub trait RowSource: Send {
    /// Open the row stream
    async fn read(&mut self, config: &IngestConfig) -> Result<RowStream, SourceError>;

    /// Row count when known up front
    fn total_row_count(&self) -> Option<u64>;

    /// Where the data was resolved to, if anywhere
    fn processed_location(&self) -> Option<String>;

    /// Release held resources; called exactly once per run
    async fn cleanup(&mut self);
}

/// Builds a source for a payload
pub type SourceFactory =
    Arc<dyn Fn(&SourcePayload) -> Result<Box<dyn RowSource>, SourceError> + Send + Sync>;

/// Source factories keyed by source type
#[derive(Clone)]
pub struct SourceRegistry {
    factories: HashMap<String, SourceFactory>,
}

impl SourceRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, source_type: impl Into<String>, factory: F)
    where
        F: Fn(&SourcePayload) -> Result<Box<dyn RowSource>, SourceError> + Send + Sync + 'static,
    {
        self.factories.insert(source_type.into(), Arc::new(factory));
    }

    pub fn contains(&self, source_type: &str) -> bool {
        self.factories.contains_key(source_type)
    }

    /// Build the source for `source_type`
    pub fn open(
        &self,
        source_type: &str,
        payload: &SourcePayload,
    ) -> Result<Box<dyn RowSource>, IngestError> {
        let factory = self
            .factories
            .get(source_type)
            .ok_or_else(|| IngestError::UnknownSourceType(source_type.to_string()))?;
        Ok(factory(payload)?)
    }
}

impl Default for SourceRegistry {
    /// Registry with the `memory` source type
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(memory::SOURCE_TYPE, |payload| {
            Ok(Box::new(InMemorySource::from_payload(payload)?) as Box<dyn RowSource>)
        });
        registry
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&String> = self.factories.keys().collect();
        types.sort();
        f.debug_struct("SourceRegistry").field("types", &types).finish()
    }
}
