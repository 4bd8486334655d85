//! Target-entity persistence
//!
//! The pipeline never knows the storage engine behind a target entity. It
//! opens a session per unit of work (row, chunk, or autocommit) and talks to
//! it through [`EntitySession`].

pub mod memory;
pub mod postgres;

pub use memory::InMemoryEntityStore;
pub use postgres::PgEntityStore;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

use crate::error::StoreError;
use crate::importer::TargetEntity;
use crate::types::Attributes;

/// Text form of an entity's key column
pub type EntityId = String;

/// Entity found by key lookup
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub id: EntityId,
    pub attributes: Attributes,
}

/// A unit of persistence work
///
/// Atomic sessions make their writes visible only on `commit`; autocommit
/// sessions apply every write immediately and `commit`/`rollback` are no-ops.
#[async_trait]
pub trait EntitySession: Send {
    /// Find an entity of `target` whose `attribute` equals `value`
    async fn find_by_key(
        &mut self,
        target: &TargetEntity,
        attribute: &str,
        value: &Value,
    ) -> Result<Option<EntityRecord>, StoreError>;

    async fn insert(
        &mut self,
        target: &TargetEntity,
        attributes: &Attributes,
    ) -> Result<EntityId, StoreError>;

    /// Overwrite the given attributes of an existing entity
    async fn update(
        &mut self,
        target: &TargetEntity,
        id: &EntityId,
        attributes: &Attributes,
    ) -> Result<(), StoreError>;

    /// Batched lookup that sees this session's own uncommitted writes
    async fn lookup(
        &mut self,
        target: &TargetEntity,
        column: &str,
        values: &[String],
    ) -> Result<HashMap<String, EntityId>, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Entity storage engine
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn begin(&self, atomic: bool) -> Result<Box<dyn EntitySession>, StoreError>;

    /// Batched lookup: `column` text value -> entity id, for the given values
    async fn lookup(
        &self,
        target: &TargetEntity,
        column: &str,
        values: &[String],
    ) -> Result<HashMap<String, EntityId>, StoreError>;
}
