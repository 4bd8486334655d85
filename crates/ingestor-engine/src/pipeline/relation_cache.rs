//! Chunk-local foreign-key resolution
//!
//! Built once before a chunk is processed and read-only afterwards. Lookups
//! cost one query per relation per `lookup_batch` distinct values, however
//! many rows reference them.

use std::collections::{BTreeSet, HashMap};

use super::chunk::ChunkRow;
use crate::error::StoreError;
use crate::importer::{resolve_header, IngestConfig, RelationRule, TargetEntity};
use crate::store::{EntityId, EntitySession};
use crate::types::{scalar_text, Attributes};

/// `foreign_key -> (lookup value -> related id)`
#[derive(Debug, Clone, Default)]
pub struct RelationCache {
    resolved: HashMap<String, HashMap<String, EntityId>>,
}

/// Trimmed, non-empty text of the relation's source column in `row`
pub(crate) fn relation_value(rule: &RelationRule, row: &ChunkRow) -> Option<String> {
    let headers: Vec<&str> = rule.header_names().collect();
    let (_, value) = resolve_header(&row.data, &headers)?;
    let text = scalar_text(value)?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn related_entity(rule: &RelationRule) -> TargetEntity {
    let mut entity = TargetEntity::new(rule.related.clone());
    entity.key_column = rule.related_key.clone();
    entity
}

impl RelationCache {
    /// Resolve every relation value referenced by `rows`
    ///
    /// Lookups and creations go through `session`, so an atomic chunk session
    /// also rolls back the related entities it created. Missing related
    /// entities are created when the rule asks for it, except in dry runs.
    pub async fn prefetch(
        config: &IngestConfig,
        rows: &[ChunkRow],
        session: &mut dyn EntitySession,
        lookup_batch: usize,
        dry_run: bool,
    ) -> Result<Self, StoreError> {
        let mut cache = Self::default();
        let lookup_batch = lookup_batch.max(1);

        for rule in &config.relations {
            let distinct: BTreeSet<String> =
                rows.iter().filter_map(|row| relation_value(rule, row)).collect();
            let mut resolved = HashMap::with_capacity(distinct.len());
            if distinct.is_empty() {
                cache.resolved.insert(rule.foreign_key.clone(), resolved);
                continue;
            }

            let related = related_entity(rule);
            let values: Vec<String> = distinct.into_iter().collect();
            for batch in values.chunks(lookup_batch) {
                resolved.extend(session.lookup(&related, &rule.lookup_column, batch).await?);
            }

            if rule.create_missing && !dry_run {
                let missing: Vec<&String> =
                    values.iter().filter(|v| !resolved.contains_key(*v)).collect();
                if !missing.is_empty() {
                    let created = Self::create_missing(session, rule, &related, &missing).await?;
                    resolved.extend(created);
                }
            }

            tracing::trace!(
                relation = %rule.foreign_key,
                distinct = values.len(),
                resolved = resolved.len(),
                "Prefetched relation"
            );
            cache.resolved.insert(rule.foreign_key.clone(), resolved);
        }

        Ok(cache)
    }

    async fn create_missing(
        session: &mut dyn EntitySession,
        rule: &RelationRule,
        related: &TargetEntity,
        missing: &[&String],
    ) -> Result<HashMap<String, EntityId>, StoreError> {
        let mut created = HashMap::with_capacity(missing.len());
        for value in missing {
            let mut attributes = Attributes::new();
            attributes.insert(
                rule.lookup_column.clone(),
                serde_json::Value::String((*value).clone()),
            );
            match session.insert(related, &attributes).await {
                Ok(id) => {
                    created.insert((*value).clone(), id);
                },
                // Another chunk created it first
                Err(StoreError::Conflict { .. } | StoreError::UniqueViolation { .. }) => {
                    let found = session
                        .lookup(related, &rule.lookup_column, std::slice::from_ref(*value))
                        .await?;
                    created.extend(found);
                },
                Err(err) => return Err(err),
            }
        }
        Ok(created)
    }

    /// Related id for a lookup value
    pub fn resolve(&self, rule: &RelationRule, value: &str) -> Option<&EntityId> {
        self.resolved.get(&rule.foreign_key)?.get(value)
    }

    /// Number of resolved values across all relations
    pub fn len(&self) -> usize {
        self.resolved.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::importer::FieldMapping;
    use crate::store::{EntityStore, InMemoryEntityStore};
    use serde_json::json;

    fn rows(values: &[&str]) -> Vec<ChunkRow> {
        values
            .iter()
            .enumerate()
            .map(|(i, brand)| ChunkRow {
                row_number: i as u64 + 1,
                data: json!({ "sku": format!("S{i}"), "Brand": brand })
                    .as_object()
                    .cloned()
                    .unwrap(),
            })
            .collect()
    }

    fn config(create_missing: bool) -> IngestConfig {
        let mut rule = RelationRule::new("brand", "brand_id", "brands", "name");
        rule.create_missing = create_missing;
        IngestConfig::builder("products", "memory", TargetEntity::new("products"))
            .field(FieldMapping::new("sku", "sku"))
            .relation(rule)
            .build()
    }

    #[tokio::test]
    async fn test_resolves_existing_and_leaves_unknown_unresolved() {
        let store = InMemoryEntityStore::new();
        let acme = store
            .seed(&TargetEntity::new("brands"), json!({ "name": "Acme" }).as_object().cloned().unwrap())
            .await
            .unwrap();
        let config = config(false);

        let mut session = store.begin(false).await.unwrap();
        let cache = RelationCache::prefetch(
            &config,
            &rows(&["Acme", " Acme ", "Globex", ""]),
            session.as_mut(),
            1,
            false,
        )
        .await
        .unwrap();

        let rule = &config.relations[0];
        assert_eq!(cache.resolve(rule, "Acme"), Some(&acme));
        assert_eq!(cache.resolve(rule, "Globex"), None);
        assert_eq!(store.count("brands").await, 1);
    }

    #[tokio::test]
    async fn test_creates_missing_once_per_distinct_value() {
        let store = InMemoryEntityStore::new();
        let config = config(true);

        let mut session = store.begin(false).await.unwrap();
        let cache = RelationCache::prefetch(
            &config,
            &rows(&["Acme", "Acme", "Globex"]),
            session.as_mut(),
            1000,
            false,
        )
        .await
        .unwrap();
        session.commit().await.unwrap();

        assert_eq!(store.count("brands").await, 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_dry_run_never_creates() {
        let store = InMemoryEntityStore::new();
        let config = config(true);

        let mut session = store.begin(false).await.unwrap();
        let cache = RelationCache::prefetch(&config, &rows(&["Acme"]), session.as_mut(), 1000, true)
            .await
            .unwrap();

        assert!(cache.is_empty());
        assert_eq!(store.count("brands").await, 0);
    }

    #[tokio::test]
    async fn test_created_entities_roll_back_with_atomic_session() {
        let store = InMemoryEntityStore::new();
        let config = config(true);
        let rule = &config.relations[0];

        let mut session = store.begin(true).await.unwrap();
        let cache = RelationCache::prefetch(&config, &rows(&["Acme", "Globex"]), session.as_mut(), 1000, false)
            .await
            .unwrap();
        assert!(cache.resolve(rule, "Acme").is_some());
        session.rollback().await.unwrap();

        assert_eq!(store.count("brands").await, 0);
    }
}
