//! In-memory entity store
//!
//! Atomic sessions hold the store lock for their whole lifetime and restore a
//! snapshot on rollback. The key column is stored alongside the other
//! attributes as text.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{EntityId, EntityRecord, EntitySession, EntityStore};
use crate::error::StoreError;
use crate::importer::TargetEntity;
use crate::types::{scalar_text, Attributes};

#[derive(Debug, Clone, Default)]
struct Tables {
    rows: HashMap<String, BTreeMap<EntityId, Attributes>>,
    unique: HashMap<String, HashSet<String>>,
    next_id: u64,
}

impl Tables {
    fn find(&self, table: &str, attribute: &str, value: &Value) -> Option<EntityRecord> {
        let wanted = scalar_text(value)?;
        self.rows.get(table)?.iter().find_map(|(id, attributes)| {
            let matches =
                attributes.get(attribute).and_then(scalar_text).as_deref() == Some(&wanted);
            matches.then(|| EntityRecord {
                id: id.clone(),
                attributes: attributes.clone(),
            })
        })
    }

    fn lookup(&self, table: &str, column: &str, values: &[String]) -> HashMap<String, EntityId> {
        let wanted: HashSet<&str> = values.iter().map(String::as_str).collect();
        let mut found = HashMap::new();
        for (id, attributes) in self.rows.get(table).into_iter().flatten() {
            let text = attributes.get(column).and_then(scalar_text);
            if let Some(text) = text.filter(|t| wanted.contains(t.as_str())) {
                found.entry(text).or_insert_with(|| id.clone());
            }
        }
        found
    }

    fn check_unique(
        &self,
        table: &str,
        except: Option<&EntityId>,
        attributes: &Attributes,
    ) -> Result<(), StoreError> {
        let Some(columns) = self.unique.get(table) else {
            return Ok(());
        };
        for column in columns {
            let Some(value) = attributes.get(column).and_then(scalar_text) else {
                continue;
            };
            let taken = self.rows.get(table).is_some_and(|rows| {
                rows.iter().any(|(id, existing)| {
                    Some(id) != except
                        && existing.get(column).and_then(scalar_text).as_deref() == Some(&value)
                })
            });
            if taken {
                return Err(StoreError::Conflict {
                    attribute: column.clone(),
                    value,
                });
            }
        }
        Ok(())
    }

    fn insert(&mut self, target: &TargetEntity, attributes: &Attributes) -> Result<EntityId, StoreError> {
        self.check_unique(&target.name, None, attributes)?;
        let id = match attributes.get(&target.key_column).and_then(scalar_text) {
            Some(id) => id,
            None => {
                self.next_id += 1;
                self.next_id.to_string()
            },
        };
        let table = self.rows.entry(target.name.clone()).or_default();
        if table.contains_key(&id) {
            return Err(StoreError::Conflict {
                attribute: target.key_column.clone(),
                value: id,
            });
        }
        let mut stored = attributes.clone();
        stored.insert(target.key_column.clone(), Value::String(id.clone()));
        table.insert(id.clone(), stored);
        Ok(id)
    }

    fn update(
        &mut self,
        target: &TargetEntity,
        id: &EntityId,
        attributes: &Attributes,
    ) -> Result<(), StoreError> {
        self.check_unique(&target.name, Some(id), attributes)?;
        let existing = self
            .rows
            .get_mut(&target.name)
            .and_then(|rows| rows.get_mut(id))
            .ok_or_else(|| StoreError::NotFound {
                entity: target.name.clone(),
                id: id.clone(),
            })?;
        for (attribute, value) in attributes {
            if *attribute != target.key_column {
                existing.insert(attribute.clone(), value.clone());
            }
        }
        Ok(())
    }
}

/// Entity store held in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryEntityStore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes that would duplicate `column` within `table`
    pub async fn with_unique(self, table: &str, column: &str) -> Self {
        self.tables
            .lock()
            .await
            .unique
            .entry(table.to_string())
            .or_default()
            .insert(column.to_string());
        self
    }

    /// Insert an entity directly, bypassing any session
    pub async fn seed(&self, target: &TargetEntity, attributes: Attributes) -> Result<EntityId, StoreError> {
        self.tables.lock().await.insert(target, &attributes)
    }

    /// All entities of a table, ordered by id
    pub async fn entities(&self, table: &str) -> Vec<EntityRecord> {
        let tables = self.tables.lock().await;
        tables
            .rows
            .get(table)
            .map(|rows| {
                rows.iter()
                    .map(|(id, attributes)| EntityRecord {
                        id: id.clone(),
                        attributes: attributes.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn count(&self, table: &str) -> usize {
        self.tables
            .lock()
            .await
            .rows
            .get(table)
            .map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn begin(&self, atomic: bool) -> Result<Box<dyn EntitySession>, StoreError> {
        if atomic {
            let guard = self.tables.clone().lock_owned().await;
            let snapshot = (*guard).clone();
            Ok(Box::new(AtomicSession { guard, snapshot }))
        } else {
            Ok(Box::new(AutocommitSession {
                tables: self.tables.clone(),
            }))
        }
    }

    async fn lookup(
        &self,
        target: &TargetEntity,
        column: &str,
        values: &[String],
    ) -> Result<HashMap<String, EntityId>, StoreError> {
        Ok(self.tables.lock().await.lookup(&target.name, column, values))
    }
}

struct AutocommitSession {
    tables: Arc<Mutex<Tables>>,
}

#[async_trait]
impl EntitySession for AutocommitSession {
    async fn find_by_key(
        &mut self,
        target: &TargetEntity,
        attribute: &str,
        value: &Value,
    ) -> Result<Option<EntityRecord>, StoreError> {
        Ok(self.tables.lock().await.find(&target.name, attribute, value))
    }

    async fn insert(
        &mut self,
        target: &TargetEntity,
        attributes: &Attributes,
    ) -> Result<EntityId, StoreError> {
        self.tables.lock().await.insert(target, attributes)
    }

    async fn update(
        &mut self,
        target: &TargetEntity,
        id: &EntityId,
        attributes: &Attributes,
    ) -> Result<(), StoreError> {
        self.tables.lock().await.update(target, id, attributes)
    }

    async fn lookup(
        &mut self,
        target: &TargetEntity,
        column: &str,
        values: &[String],
    ) -> Result<HashMap<String, EntityId>, StoreError> {
        Ok(self.tables.lock().await.lookup(&target.name, column, values))
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

struct AtomicSession {
    guard: OwnedMutexGuard<Tables>,
    snapshot: Tables,
}

#[async_trait]
impl EntitySession for AtomicSession {
    async fn find_by_key(
        &mut self,
        target: &TargetEntity,
        attribute: &str,
        value: &Value,
    ) -> Result<Option<EntityRecord>, StoreError> {
        Ok(self.guard.find(&target.name, attribute, value))
    }

    async fn insert(
        &mut self,
        target: &TargetEntity,
        attributes: &Attributes,
    ) -> Result<EntityId, StoreError> {
        self.guard.insert(target, attributes)
    }

    async fn update(
        &mut self,
        target: &TargetEntity,
        id: &EntityId,
        attributes: &Attributes,
    ) -> Result<(), StoreError> {
        self.guard.update(target, id, attributes)
    }

    async fn lookup(
        &mut self,
        target: &TargetEntity,
        column: &str,
        values: &[String],
    ) -> Result<HashMap<String, EntityId>, StoreError> {
        Ok(self.guard.lookup(&target.name, column, values))
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let AtomicSession {
            mut guard,
            snapshot,
        } = *self;
        *guard = snapshot;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: Value) -> Attributes {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_autocommit_writes_are_visible() {
        let store = InMemoryEntityStore::new();
        let products = TargetEntity::new("products");

        let mut session = store.begin(false).await.unwrap();
        let id = session
            .insert(&products, &attrs(json!({ "sku": "A-1", "name": "Widget" })))
            .await
            .unwrap();
        session.commit().await.unwrap();

        let found = store
            .begin(false)
            .await
            .unwrap()
            .find_by_key(&products, "sku", &json!("A-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.attributes["name"], json!("Widget"));
    }

    #[tokio::test]
    async fn test_atomic_rollback_restores_snapshot() {
        let store = InMemoryEntityStore::new();
        let products = TargetEntity::new("products");
        store
            .seed(&products, attrs(json!({ "sku": "A-1", "name": "Old" })))
            .await
            .unwrap();

        let mut session = store.begin(true).await.unwrap();
        let existing = session
            .find_by_key(&products, "sku", &json!("A-1"))
            .await
            .unwrap()
            .unwrap();
        session
            .update(&products, &existing.id, &attrs(json!({ "name": "New" })))
            .await
            .unwrap();
        session
            .insert(&products, &attrs(json!({ "sku": "B-2" })))
            .await
            .unwrap();
        session.rollback().await.unwrap();

        let entities = store.entities("products").await;
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].attributes["name"], json!("Old"));
    }

    #[tokio::test]
    async fn test_unique_columns_conflict() {
        let store = InMemoryEntityStore::new().with_unique("products", "sku").await;
        let products = TargetEntity::new("products");
        store
            .seed(&products, attrs(json!({ "sku": "A-1" })))
            .await
            .unwrap();

        let mut session = store.begin(false).await.unwrap();
        let err = session
            .insert(&products, &attrs(json!({ "sku": "A-1" })))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { attribute, .. } if attribute == "sku"));
    }

    #[tokio::test]
    async fn test_lookup_maps_values_to_ids() {
        let store = InMemoryEntityStore::new();
        let brands = TargetEntity::new("brands");
        let acme = store
            .seed(&brands, attrs(json!({ "name": "Acme" })))
            .await
            .unwrap();

        let found = store
            .lookup(&brands, "name", &["Acme".into(), "Globex".into()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found["Acme"], acme);
    }
}
