//! PostgreSQL entity store
//!
//! Target tables are only known at runtime, so statements are assembled from
//! identifiers that were validated against `^[A-Za-z_][A-Za-z0-9_]*$` and
//! quoted. Values never reach the SQL text: attributes travel as one JSONB
//! parameter expanded with `jsonb_populate_record`.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::{Arguments, PgPool, Postgres, Row, Transaction};
use std::collections::HashMap;
use std::sync::Arc;

use super::{EntityId, EntityRecord, EntitySession, EntityStore};
use crate::error::StoreError;
use crate::importer::definition::{validate_identifier, validate_table};
use crate::importer::TargetEntity;
use crate::types::{scalar_text, Attributes};

fn quote_ident(name: &str) -> Result<String, StoreError> {
    validate_identifier(name).map_err(|_| StoreError::InvalidIdentifier(name.to_string()))?;
    Ok(format!("\"{name}\""))
}

fn quote_table(name: &str) -> Result<String, StoreError> {
    validate_table(name).map_err(|_| StoreError::InvalidIdentifier(name.to_string()))?;
    Ok(name
        .split('.')
        .map(|part| format!("\"{part}\""))
        .collect::<Vec<_>>()
        .join("."))
}

fn map_write_error(entity: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::UniqueViolation {
            entity: entity.to_string(),
            constraint: db.constraint().unwrap_or("unique").to_string(),
        },
        other => StoreError::Database(other),
    }
}

fn find_sql(target: &TargetEntity, attribute: &str) -> Result<String, StoreError> {
    Ok(format!(
        "SELECT t.{key}::text AS entity_id, to_jsonb(t) AS entity_row \
         FROM {table} AS t WHERE t.{attr}::text = $1 LIMIT 1",
        key = quote_ident(&target.key_column)?,
        table = quote_table(&target.name)?,
        attr = quote_ident(attribute)?,
    ))
}

fn insert_sql(target: &TargetEntity, attributes: &Attributes) -> Result<String, StoreError> {
    let table = quote_table(&target.name)?;
    let key = quote_ident(&target.key_column)?;
    if attributes.is_empty() {
        return Ok(format!("INSERT INTO {table} DEFAULT VALUES RETURNING {key}::text"));
    }
    let columns = attributes
        .keys()
        .map(|c| quote_ident(c))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");
    Ok(format!(
        "INSERT INTO {table} ({columns}) \
         SELECT {columns} FROM jsonb_populate_record(NULL::{table}, $1) \
         RETURNING {key}::text"
    ))
}

fn update_sql(target: &TargetEntity, attributes: &Attributes) -> Result<Option<String>, StoreError> {
    let table = quote_table(&target.name)?;
    let key = quote_ident(&target.key_column)?;
    let assignments = attributes
        .keys()
        .filter(|c| **c != target.key_column)
        .map(|c| quote_ident(c).map(|q| format!("{q} = r.{q}")))
        .collect::<Result<Vec<_>, _>>()?;
    if assignments.is_empty() {
        return Ok(None);
    }
    Ok(Some(format!(
        "UPDATE {table} AS t SET {} \
         FROM jsonb_populate_record(NULL::{table}, $1) AS r \
         WHERE t.{key}::text = $2",
        assignments.join(", ")
    )))
}

fn lookup_sql(target: &TargetEntity, column: &str) -> Result<String, StoreError> {
    Ok(format!(
        "SELECT {col}::text, {key}::text FROM {table} WHERE {col}::text = ANY($1)",
        col = quote_ident(column)?,
        key = quote_ident(&target.key_column)?,
        table = quote_table(&target.name)?,
    ))
}

fn first_id_per_value(rows: Vec<(String, String)>) -> HashMap<String, EntityId> {
    let mut found = HashMap::with_capacity(rows.len());
    for (value, id) in rows {
        found.entry(value).or_insert(id);
    }
    found
}

fn arguments(values: Vec<Value>, texts: Vec<String>) -> Result<PgArguments, StoreError> {
    let mut args = PgArguments::default();
    for value in values {
        args.add(value)
            .map_err(|e| StoreError::Database(sqlx::Error::Encode(e)))?;
    }
    for text in texts {
        args.add(text)
            .map_err(|e| StoreError::Database(sqlx::Error::Encode(e)))?;
    }
    Ok(args)
}

fn record_from_row(row: &PgRow) -> Result<EntityRecord, StoreError> {
    let id: String = row.try_get("entity_id")?;
    let attributes = match row.try_get::<Value, _>("entity_row")? {
        Value::Object(map) => map,
        _ => Attributes::new(),
    };
    Ok(EntityRecord { id, attributes })
}

/// Entity store over arbitrary PostgreSQL tables
#[derive(Clone)]
pub struct PgEntityStore {
    pool: Arc<PgPool>,
}

impl PgEntityStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn begin(&self, atomic: bool) -> Result<Box<dyn EntitySession>, StoreError> {
        let tx = if atomic {
            Some(self.pool.begin().await?)
        } else {
            None
        };
        Ok(Box::new(PgSession {
            pool: self.pool.clone(),
            tx,
        }))
    }

    async fn lookup(
        &self,
        target: &TargetEntity,
        column: &str,
        values: &[String],
    ) -> Result<HashMap<String, EntityId>, StoreError> {
        if values.is_empty() {
            return Ok(HashMap::new());
        }
        let sql = lookup_sql(target, column)?;
        let rows: Vec<(String, String)> = sqlx::query_as(&sql)
            .bind(values)
            .fetch_all(&*self.pool)
            .await?;
        Ok(first_id_per_value(rows))
    }
}

/// Autocommit when `tx` is `None`
struct PgSession {
    pool: Arc<PgPool>,
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgSession {
    async fn fetch_optional(
        &mut self,
        sql: &str,
        args: PgArguments,
    ) -> Result<Option<PgRow>, sqlx::Error> {
        match self.tx.as_mut() {
            Some(tx) => sqlx::query_with(sql, args).fetch_optional(&mut **tx).await,
            None => sqlx::query_with(sql, args).fetch_optional(&*self.pool).await,
        }
    }

    async fn execute(&mut self, sql: &str, args: PgArguments) -> Result<u64, sqlx::Error> {
        let result = match self.tx.as_mut() {
            Some(tx) => sqlx::query_with(sql, args).execute(&mut **tx).await?,
            None => sqlx::query_with(sql, args).execute(&*self.pool).await?,
        };
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl EntitySession for PgSession {
    async fn find_by_key(
        &mut self,
        target: &TargetEntity,
        attribute: &str,
        value: &Value,
    ) -> Result<Option<EntityRecord>, StoreError> {
        let Some(text) = scalar_text(value) else {
            return Ok(None);
        };
        let sql = find_sql(target, attribute)?;
        let row = self.fetch_optional(&sql, arguments(vec![], vec![text])?).await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn insert(
        &mut self,
        target: &TargetEntity,
        attributes: &Attributes,
    ) -> Result<EntityId, StoreError> {
        let sql = insert_sql(target, attributes)?;
        let args = if attributes.is_empty() {
            PgArguments::default()
        } else {
            arguments(vec![Value::Object(attributes.clone())], vec![])?
        };
        let row = self
            .fetch_optional(&sql, args)
            .await
            .map_err(|e| map_write_error(&target.name, e))?;

        match row {
            Some(row) => Ok(row.try_get::<String, _>(0)?),
            None => Err(StoreError::NotFound {
                entity: target.name.clone(),
                id: String::new(),
            }),
        }
    }

    async fn update(
        &mut self,
        target: &TargetEntity,
        id: &EntityId,
        attributes: &Attributes,
    ) -> Result<(), StoreError> {
        let Some(sql) = update_sql(target, attributes)? else {
            return Ok(());
        };
        let args = arguments(vec![Value::Object(attributes.clone())], vec![id.clone()])?;
        let affected = self
            .execute(&sql, args)
            .await
            .map_err(|e| map_write_error(&target.name, e))?;

        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: target.name.clone(),
                id: id.clone(),
            });
        }
        Ok(())
    }

    async fn lookup(
        &mut self,
        target: &TargetEntity,
        column: &str,
        values: &[String],
    ) -> Result<HashMap<String, EntityId>, StoreError> {
        if values.is_empty() {
            return Ok(HashMap::new());
        }
        let sql = lookup_sql(target, column)?;
        let query = sqlx::query_as::<_, (String, String)>(&sql).bind(values);
        let rows = match self.tx.as_mut() {
            Some(tx) => query.fetch_all(&mut **tx).await?,
            None => query.fetch_all(&*self.pool).await?,
        };
        Ok(first_id_per_value(rows))
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        if let Some(tx) = self.tx {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        if let Some(tx) = self.tx {
            tx.rollback().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tables_are_quoted_per_segment() {
        assert_eq!(quote_table("catalog.products").unwrap(), "\"catalog\".\"products\"");
        assert!(matches!(
            quote_table("products; DROP TABLE x"),
            Err(StoreError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_insert_statement_shape() {
        let target = TargetEntity::new("products");
        let attributes = json!({ "sku": "A-1", "name": "Widget" })
            .as_object()
            .cloned()
            .unwrap();
        let sql = insert_sql(&target, &attributes).unwrap();
        assert!(sql.starts_with("INSERT INTO \"products\" (\"name\", \"sku\")"));
        assert!(sql.contains("jsonb_populate_record(NULL::\"products\", $1)"));
        assert!(sql.ends_with("RETURNING \"id\"::text"));
    }

    #[test]
    fn test_update_skips_key_column() {
        let target = TargetEntity::new("products");
        let attributes = json!({ "id": "7", "name": "Widget" })
            .as_object()
            .cloned()
            .unwrap();
        let sql = update_sql(&target, &attributes).unwrap().unwrap();
        assert!(sql.contains("SET \"name\" = r.\"name\""));
        assert!(!sql.contains("\"id\" = r.\"id\""));

        let only_key = json!({ "id": "7" }).as_object().cloned().unwrap();
        assert!(update_sql(&target, &only_key).unwrap().is_none());
    }
}
