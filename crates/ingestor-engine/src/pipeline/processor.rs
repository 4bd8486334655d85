//! Per-chunk row processing
//!
//! validate -> map + transform -> resolve relations -> persist with the
//! duplicate policy -> log. Row failures are recorded and never abort sibling
//! rows, except in `chunk` transaction mode where the first failure rolls the
//! whole chunk back and becomes a chunk-fatal error.

use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use super::chunk::{Chunk, ChunkRow, ChunkTally};
use super::relation_cache::{relation_value, RelationCache};
use crate::error::{IngestError, Result, StoreError};
use crate::importer::{
    resolve_header, DuplicateStrategy, IngestConfig, TransactionMode, TransformRegistry, Validator,
};
use crate::repository::RunRepository;
use crate::store::{EntityId, EntitySession, EntityStore};
use crate::types::{is_blank, scalar_text, Attributes, NewIngestRow, RowError, RowStatus};

/// What happened to the target entity for one row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowAction {
    Created(EntityId),
    Updated(EntityId),
    /// Existing entity left untouched under the `skip` strategy
    Skipped(EntityId),
    /// Would have been written; dry run
    Simulated,
    Failed,
}

/// Result of processing one row
#[derive(Debug, Clone)]
pub struct RowOutcome {
    pub row_number: u64,
    pub action: RowAction,
    pub attributes: Attributes,
    pub error: Option<RowError>,
}

impl RowOutcome {
    fn failed(row_number: u64, error: RowError) -> Self {
        Self {
            row_number,
            action: RowAction::Failed,
            attributes: Attributes::new(),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn status(&self) -> RowStatus {
        if self.is_success() {
            RowStatus::Success
        } else {
            RowStatus::Failed
        }
    }
}

/// Processes the chunks of one importer
pub struct RowProcessor {
    config: Arc<IngestConfig>,
    transforms: Arc<TransformRegistry>,
    store: Arc<dyn EntityStore>,
    repository: Arc<dyn RunRepository>,
    relation_lookup_batch: usize,
}

impl RowProcessor {
    pub fn new(
        config: Arc<IngestConfig>,
        transforms: Arc<TransformRegistry>,
        store: Arc<dyn EntityStore>,
        repository: Arc<dyn RunRepository>,
        relation_lookup_batch: usize,
    ) -> Self {
        Self {
            config,
            transforms,
            store,
            repository,
            relation_lookup_batch,
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Process every row of `chunk` and log the outcomes in one batch
    #[tracing::instrument(skip(self, chunk), fields(run_id = %chunk.run_id, chunk = chunk.index, rows = chunk.len()))]
    pub async fn process_chunk(&self, chunk: &Chunk, dry_run: bool) -> Result<ChunkTally> {
        let validator = Validator::compile(&self.config)?;

        let outcomes = match self.config.transaction_mode {
            TransactionMode::None => self.process_autocommit(chunk, &validator, dry_run).await?,
            TransactionMode::Row => self.process_row_atomic(chunk, &validator, dry_run).await?,
            TransactionMode::Chunk => self.process_chunk_atomic(chunk, &validator, dry_run).await?,
        };

        let mut tally = ChunkTally::default();
        let mut log = Vec::with_capacity(if self.config.log_rows { outcomes.len() } else { 0 });
        for (row, outcome) in chunk.rows.iter().zip(&outcomes) {
            tally.record(outcome.is_success());
            if self.config.log_rows {
                log.push(NewIngestRow {
                    row_number: i64::try_from(row.row_number).unwrap_or(i64::MAX),
                    status: outcome.status(),
                    data: row.data.clone(),
                    errors: outcome.error.clone(),
                });
            }
        }
        if !log.is_empty() {
            self.repository.insert_rows(chunk.run_id, &log).await?;
        }

        tracing::debug!(
            successful = tally.successful,
            failed = tally.failed,
            "Chunk processed"
        );
        Ok(tally)
    }

    async fn prefetch(
        &self,
        chunk: &Chunk,
        session: &mut dyn EntitySession,
        dry_run: bool,
    ) -> std::result::Result<RelationCache, StoreError> {
        RelationCache::prefetch(
            &self.config,
            &chunk.rows,
            session,
            self.relation_lookup_batch,
            dry_run,
        )
        .await
    }

    async fn process_autocommit(
        &self,
        chunk: &Chunk,
        validator: &Validator,
        dry_run: bool,
    ) -> Result<Vec<RowOutcome>> {
        let mut session = self.store.begin(false).await?;
        let cache = self.prefetch(chunk, session.as_mut(), dry_run).await?;
        let mut outcomes = Vec::with_capacity(chunk.len());
        for row in &chunk.rows {
            outcomes.push(self.process_row(session.as_mut(), validator, &cache, row, dry_run).await);
        }
        session.commit().await?;
        Ok(outcomes)
    }

    async fn process_row_atomic(
        &self,
        chunk: &Chunk,
        validator: &Validator,
        dry_run: bool,
    ) -> Result<Vec<RowOutcome>> {
        // Related entities are shared by the chunk's rows and commit on their own
        let cache = {
            let mut session = self.store.begin(false).await?;
            let cache = self.prefetch(chunk, session.as_mut(), dry_run).await?;
            session.commit().await?;
            cache
        };

        let mut outcomes = Vec::with_capacity(chunk.len());
        for row in &chunk.rows {
            let mut session = self.store.begin(true).await?;
            let outcome = self.process_row(session.as_mut(), validator, &cache, row, dry_run).await;
            if outcome.is_success() && !dry_run {
                session.commit().await?;
            } else {
                session.rollback().await?;
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn process_chunk_atomic(
        &self,
        chunk: &Chunk,
        validator: &Validator,
        dry_run: bool,
    ) -> Result<Vec<RowOutcome>> {
        let mut session = self.store.begin(true).await?;
        let cache = match self.prefetch(chunk, session.as_mut(), dry_run).await {
            Ok(cache) => cache,
            Err(err) => {
                session.rollback().await?;
                return Err(err.into());
            },
        };

        let mut outcomes = Vec::with_capacity(chunk.len());
        for row in &chunk.rows {
            let outcome = self.process_row(session.as_mut(), validator, &cache, row, dry_run).await;
            if let Some(error) = &outcome.error {
                session.rollback().await?;
                tracing::warn!(row = row.row_number, error = %error.message, "Chunk transaction rolled back");
                return Err(IngestError::ChunkFatal {
                    run_id: chunk.run_id,
                    chunk: chunk.index,
                    row_number: row.row_number,
                    message: error.message.clone(),
                });
            }
            outcomes.push(outcome);
        }
        if dry_run {
            session.rollback().await?;
        } else {
            session.commit().await?;
        }
        Ok(outcomes)
    }

    /// Process one row; every failure becomes a failed outcome
    pub async fn process_row(
        &self,
        session: &mut dyn EntitySession,
        validator: &Validator,
        cache: &RelationCache,
        row: &ChunkRow,
        dry_run: bool,
    ) -> RowOutcome {
        let errors = validator.validate(&row.data);
        if !errors.is_empty() {
            return RowOutcome::failed(row.row_number, RowError::validation(errors));
        }

        let attributes = match self.build_attributes(row, cache) {
            Ok(attributes) => attributes,
            Err(error) => return RowOutcome::failed(row.row_number, error),
        };

        match self.persist(session, &attributes, dry_run).await {
            Ok(action) => RowOutcome {
                row_number: row.row_number,
                action,
                attributes,
                error: None,
            },
            Err(error) => RowOutcome::failed(row.row_number, error),
        }
    }

    /// Target attributes for a row: mapped fields, relations, then fillable
    /// pass-through
    pub fn build_attributes(
        &self,
        row: &ChunkRow,
        cache: &RelationCache,
    ) -> std::result::Result<Attributes, RowError> {
        let config = &self.config;
        let mut attributes = Attributes::new();
        let mut consumed: HashSet<&str> = HashSet::new();
        let mut transform_errors: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for mapping in &config.fields {
            let headers: Vec<&str> = mapping.header_names().collect();
            let raw = resolve_header(&row.data, &headers);
            if let Some((key, _)) = raw {
                consumed.insert(key.as_str());
            }

            let value = match (&mapping.transform, raw) {
                (Some(transform), raw) => {
                    let input = raw.map_or(Value::Null, |(_, v)| v.clone());
                    match self.transforms.apply(transform, &input, &row.data) {
                        Ok(value) => value,
                        Err(reason) => {
                            transform_errors
                                .entry(mapping.target.clone())
                                .or_default()
                                .push(format!(
                                    "The {} field is invalid: {reason}.",
                                    mapping.target.replace('_', " ")
                                ));
                            continue;
                        },
                    }
                },
                (None, Some((_, value))) => value.clone(),
                (None, None) => continue,
            };
            attributes.insert(mapping.target.clone(), value);
        }

        if !transform_errors.is_empty() {
            return Err(RowError::validation(transform_errors));
        }

        for rule in &config.relations {
            let headers: Vec<&str> = rule.header_names().collect();
            if let Some((key, _)) = resolve_header(&row.data, &headers) {
                consumed.insert(key.as_str());
            }
            let resolved = relation_value(rule, row)
                .and_then(|value| cache.resolve(rule, &value).cloned())
                .map_or(Value::Null, Value::String);
            attributes.insert(rule.foreign_key.clone(), resolved);
        }

        if config.copy_fillable {
            for (column, value) in &row.data {
                if consumed.contains(column.as_str()) {
                    continue;
                }
                let name = column.trim();
                if config.target.fillable.iter().any(|f| f == name) && !attributes.contains_key(name) {
                    attributes.insert(name.to_string(), value.clone());
                }
            }
        }

        Ok(attributes)
    }

    async fn persist(
        &self,
        session: &mut dyn EntitySession,
        attributes: &Attributes,
        dry_run: bool,
    ) -> std::result::Result<RowAction, RowError> {
        let target = &self.config.target;

        let existing = match &self.config.duplicate {
            Some(policy) => match attributes.get(&policy.key_attribute) {
                Some(key) if !is_blank(key) => session
                    .find_by_key(target, &policy.key_attribute, key)
                    .await
                    .map_err(store_row_error)?
                    .map(|record| (policy, key, record)),
                _ => None,
            },
            None => None,
        };

        match existing {
            Some((policy, key, record)) => match policy.strategy {
                DuplicateStrategy::Skip => Ok(RowAction::Skipped(record.id)),
                DuplicateStrategy::Fail => Err(RowError::message(
                    StoreError::Conflict {
                        attribute: policy.key_attribute.clone(),
                        value: scalar_text(key).unwrap_or_default(),
                    }
                    .to_string(),
                )),
                DuplicateStrategy::Update if dry_run => Ok(RowAction::Simulated),
                DuplicateStrategy::Update => {
                    session
                        .update(target, &record.id, attributes)
                        .await
                        .map_err(store_row_error)?;
                    Ok(RowAction::Updated(record.id))
                },
            },
            None if dry_run => Ok(RowAction::Simulated),
            None => session
                .insert(target, attributes)
                .await
                .map(RowAction::Created)
                .map_err(store_row_error),
        }
    }
}

fn store_row_error(err: StoreError) -> RowError {
    RowError::message(err.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::importer::{FieldMapping, TargetEntity};
    use crate::repository::InMemoryRunRepository;
    use crate::store::InMemoryEntityStore;
    use serde_json::json;

    fn processor(config: IngestConfig) -> RowProcessor {
        RowProcessor::new(
            Arc::new(config),
            Arc::new(TransformRegistry::default()),
            Arc::new(InMemoryEntityStore::new()),
            Arc::new(InMemoryRunRepository::new()),
            1000,
        )
    }

    fn row(data: Value) -> ChunkRow {
        ChunkRow {
            row_number: 1,
            data: data.as_object().cloned().unwrap(),
        }
    }

    #[test]
    fn test_mapping_applies_aliases_and_transforms() {
        let config = IngestConfig::builder("products", "memory", TargetEntity::new("products"))
            .field(FieldMapping::new("sku", "sku").alias("SKU Code").transform("uppercase"))
            .field(FieldMapping::new("price", "price").transform("decimal"))
            .field(FieldMapping::new("stock", "stock").transform_with("default", vec![json!(0)]))
            .field(FieldMapping::new("color", "color"))
            .build();

        let attributes = processor(config)
            .build_attributes(
                &row(json!({ "SKU Code": "ab-1", "price": "9.50" })),
                &RelationCache::default(),
            )
            .unwrap();

        assert_eq!(attributes["sku"], json!("AB-1"));
        assert_eq!(attributes["price"], json!(9.5));
        // Absent column with a transform still runs the transform
        assert_eq!(attributes["stock"], json!(0));
        // Absent column without a transform is not written
        assert!(!attributes.contains_key("color"));
    }

    #[test]
    fn test_transform_failure_is_a_row_error() {
        let config = IngestConfig::builder("products", "memory", TargetEntity::new("products"))
            .field(FieldMapping::new("qty", "quantity").transform("integer"))
            .build();

        let err = processor(config)
            .build_attributes(&row(json!({ "qty": "many" })), &RelationCache::default())
            .unwrap_err();

        assert_eq!(err.fields["quantity"].len(), 1);
        assert!(err.message.starts_with("The quantity field is invalid"));
    }

    #[test]
    fn test_fillable_columns_are_copied_only_when_enabled() {
        let target = TargetEntity::new("products").fillable(["notes"]);
        let builder = IngestConfig::builder("products", "memory", target)
            .field(FieldMapping::new("sku", "sku"));

        let data = json!({ "sku": "A", "notes": "fragile", "secret": "x" });
        let copied = processor(builder.build())
            .build_attributes(&row(data.clone()), &RelationCache::default())
            .unwrap();
        assert!(!copied.contains_key("notes"));

        let target = TargetEntity::new("products").fillable(["notes"]);
        let config = IngestConfig::builder("products", "memory", target)
            .field(FieldMapping::new("sku", "sku"))
            .copy_fillable(true)
            .build();
        let copied = processor(config)
            .build_attributes(&row(data), &RelationCache::default())
            .unwrap();
        assert_eq!(copied["notes"], json!("fragile"));
        assert!(!copied.contains_key("secret"));
    }
}
