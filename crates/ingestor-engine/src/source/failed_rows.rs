//! Failed rows of a previous run, replayed as a source

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::Arc;
use uuid::Uuid;

use super::{RowSource, RowStream};
use crate::error::SourceError;
use crate::importer::IngestConfig;
use crate::repository::{RunRepository, DEFAULT_FAILED_ROW_PAGE};
use crate::types::RowData;

/// Streams the logged payloads of a run's failed rows, in row order, one
/// keyset page at a time
pub struct FailedRowsSource {
    repository: Arc<dyn RunRepository>,
    run_id: Uuid,
    expected: Option<u64>,
    page_size: i64,
}

impl FailedRowsSource {
    pub fn new(repository: Arc<dyn RunRepository>, run_id: Uuid, expected: Option<u64>) -> Self {
        Self {
            repository,
            run_id,
            expected,
            page_size: DEFAULT_FAILED_ROW_PAGE,
        }
    }

    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

#[async_trait]
impl RowSource for FailedRowsSource {
    async fn read(&mut self, _config: &IngestConfig) -> Result<RowStream, SourceError> {
        let repository = self.repository.clone();
        let run_id = self.run_id;
        let page_size = self.page_size;

        let pages = stream::try_unfold(Some(0_i64), move |cursor| {
            let repository = repository.clone();
            async move {
                let Some(after) = cursor else {
                    return Ok(None);
                };
                let page = repository.failed_rows(run_id, after, page_size).await?;
                if page.is_empty() {
                    return Ok(None);
                }
                let next = if (page.len() as i64) < page_size {
                    None
                } else {
                    page.last().map(|row| row.row_number)
                };
                let rows: Vec<Result<RowData, SourceError>> =
                    page.into_iter().map(|row| Ok(row.data)).collect();
                Ok::<_, SourceError>(Some((stream::iter(rows), next)))
            }
        });

        Ok(pages.try_flatten().boxed())
    }

    fn total_row_count(&self) -> Option<u64> {
        self.expected
    }

    fn processed_location(&self) -> Option<String> {
        Some(format!("ingest_run://{}/failed", self.run_id))
    }

    async fn cleanup(&mut self) {}
}
