//! Rows supplied directly by the caller

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::{RowSource, RowStream, SourcePayload};
use crate::error::SourceError;
use crate::importer::IngestConfig;
use crate::types::RowData;

pub const SOURCE_TYPE: &str = "memory";

/// Source over an in-memory list of rows
///
/// Built from a payload, rows come from the `rows` option, which must be an
/// array of objects.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    rows: Vec<RowData>,
    total: u64,
    location: Option<String>,
    cleanups: Arc<AtomicUsize>,
}

impl InMemorySource {
    pub fn new(rows: Vec<RowData>) -> Self {
        Self {
            total: rows.len() as u64,
            rows,
            location: None,
            cleanups: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn from_payload(payload: &SourcePayload) -> Result<Self, SourceError> {
        let Value::Array(items) = payload.require("rows")? else {
            return Err(SourceError::Unreadable(
                "option 'rows' must be an array of objects".to_string(),
            ));
        };
        let rows = items
            .iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::Object(row) => Ok(row.clone()),
                _ => Err(SourceError::MalformedRow {
                    row: i as u64 + 1,
                    reason: "expected an object".to_string(),
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut source = Self::new(rows);
        source.location = payload.original_name.as_ref().map(|n| format!("memory://{n}"));
        Ok(source)
    }

    /// Shared counter of `cleanup` calls
    pub fn cleanup_counter(&self) -> Arc<AtomicUsize> {
        self.cleanups.clone()
    }
}

#[async_trait]
impl RowSource for InMemorySource {
    async fn read(&mut self, _config: &IngestConfig) -> Result<RowStream, SourceError> {
        let rows = std::mem::take(&mut self.rows);
        Ok(stream::iter(rows.into_iter().map(Ok)).boxed())
    }

    fn total_row_count(&self) -> Option<u64> {
        Some(self.total)
    }

    fn processed_location(&self) -> Option<String> {
        self.location.clone()
    }

    async fn cleanup(&mut self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}
