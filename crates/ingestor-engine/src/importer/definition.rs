//! Importer configuration
//!
//! An [`IngestConfig`] describes how rows from one source type become one
//! target entity. Configurations are plain data (serde) so they can be loaded
//! from JSON and shipped to workers; transforms are referenced by name and
//! resolved through the [`TransformRegistry`](super::TransformRegistry).

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;

use super::transform::TransformRegistry;
use super::validation::{FieldRules, ValidationRule};
use crate::error::ConfigError;
use crate::types::RowData;

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap()
});

/// Policy for rows whose key matches an existing entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateStrategy {
    /// Overwrite the mapped attributes of the existing entity
    #[default]
    Update,
    /// Leave the existing entity untouched; the row still succeeds
    Skip,
    /// Record the row as failed
    Fail,
}

/// Granularity of atomic persistence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransactionMode {
    /// Every write commits on its own
    #[default]
    None,
    /// Lookup and write of one row share a transaction
    Row,
    /// The whole chunk is one transaction; any row failure aborts it
    Chunk,
}

/// Target entity declaration supplied by whoever owns persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetEntity {
    /// Table (optionally schema-qualified) or collection name
    pub name: String,
    #[serde(default = "default_key_column")]
    pub key_column: String,
    /// Attributes that unmapped source columns may be copied into
    #[serde(default)]
    pub fillable: Vec<String>,
    /// The entity's own validation rules
    #[serde(default)]
    pub rules: Vec<FieldRules>,
}

fn default_key_column() -> String {
    "id".to_string()
}

fn default_true() -> bool {
    true
}

impl TargetEntity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_column: default_key_column(),
            fillable: Vec::new(),
            rules: Vec::new(),
        }
    }

    pub fn fillable<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fillable = attributes.into_iter().map(Into::into).collect();
        self
    }

    pub fn rule(mut self, field: impl Into<String>, rules: Vec<ValidationRule>) -> Self {
        self.rules.push(FieldRules::new(field, rules));
        self
    }
}

/// Named transform plus its arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
}

/// Source column -> target attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub transform: Option<TransformRef>,
}

impl FieldMapping {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            aliases: Vec::new(),
            transform: None,
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn transform(self, name: impl Into<String>) -> Self {
        self.transform_with(name, Vec::new())
    }

    pub fn transform_with(mut self, name: impl Into<String>, args: Vec<Value>) -> Self {
        self.transform = Some(TransformRef {
            name: name.into(),
            args,
        });
        self
    }

    /// Header names accepted for this mapping, in priority order
    pub fn header_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.source.as_str()).chain(self.aliases.iter().map(String::as_str))
    }
}

/// Source column -> foreign key resolved against a related entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationRule {
    pub source: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Attribute on the target entity receiving the related id
    pub foreign_key: String,
    /// Related table / collection
    pub related: String,
    #[serde(default = "default_key_column")]
    pub related_key: String,
    /// Column on the related entity matched against the source value
    pub lookup_column: String,
    /// Create the related entity when no match exists
    #[serde(default)]
    pub create_missing: bool,
}

impl RelationRule {
    pub fn new(
        source: impl Into<String>,
        foreign_key: impl Into<String>,
        related: impl Into<String>,
        lookup_column: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            aliases: Vec::new(),
            foreign_key: foreign_key.into(),
            related: related.into(),
            related_key: default_key_column(),
            lookup_column: lookup_column.into(),
            create_missing: false,
        }
    }

    pub fn create_missing(mut self) -> Self {
        self.create_missing = true;
        self
    }

    pub fn header_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.source.as_str()).chain(self.aliases.iter().map(String::as_str))
    }
}

/// Key attribute + strategy for existing entities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicatePolicy {
    pub key_attribute: String,
    #[serde(default)]
    pub strategy: DuplicateStrategy,
}

/// Per-importer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestConfig {
    pub importer: String,
    /// Key into the source registry
    pub source_type: String,
    pub target: TargetEntity,
    #[serde(default)]
    pub fields: Vec<FieldMapping>,
    #[serde(default)]
    pub relations: Vec<RelationRule>,
    #[serde(default)]
    pub duplicate: Option<DuplicatePolicy>,
    #[serde(default)]
    pub validation: Vec<FieldRules>,
    /// Also apply `target.rules` (additive)
    #[serde(default)]
    pub use_entity_rules: bool,
    /// Copy unmapped source columns listed in `target.fillable`
    #[serde(default)]
    pub copy_fillable: bool,
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub transaction_mode: TransactionMode,
    /// Write one row-log entry per processed row
    #[serde(default = "default_true")]
    pub log_rows: bool,
}

impl IngestConfig {
    pub fn builder(
        importer: impl Into<String>,
        source_type: impl Into<String>,
        target: TargetEntity,
    ) -> IngestConfigBuilder {
        IngestConfigBuilder {
            config: IngestConfig {
                importer: importer.into(),
                source_type: source_type.into(),
                target,
                fields: Vec::new(),
                relations: Vec::new(),
                duplicate: None,
                validation: Vec::new(),
                use_entity_rules: false,
                copy_fillable: false,
                chunk_size: None,
                transaction_mode: TransactionMode::None,
                log_rows: true,
            },
        }
    }

    pub fn chunk_size_or(&self, default: usize) -> usize {
        self.chunk_size.unwrap_or(default).max(1)
    }

    /// The mapping that produces the duplicate-key attribute
    pub fn key_mapping(&self) -> Option<&FieldMapping> {
        let policy = self.duplicate.as_ref()?;
        self.fields.iter().find(|m| m.target == policy.key_attribute)
    }

    /// Declared rules, plus the entity's own when enabled
    pub fn effective_rules(&self) -> impl Iterator<Item = &FieldRules> {
        let entity_rules: &[FieldRules] = if self.use_entity_rules {
            &self.target.rules
        } else {
            &[]
        };
        self.validation.iter().chain(entity_rules.iter())
    }

    /// Header names that may carry `field`, whether it is named by source or
    /// target attribute
    pub fn header_names_for<'a>(&'a self, field: &'a str) -> Vec<&'a str> {
        let mut names = vec![field];
        for mapping in self
            .fields
            .iter()
            .filter(|m| m.source == field || m.target == field)
        {
            for name in mapping.header_names() {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Reject configurations that could never run
    pub fn validate(&self, transforms: &TransformRegistry) -> Result<(), ConfigError> {
        if self.importer.trim().is_empty() {
            return Err(ConfigError::EmptyImporter);
        }
        if self.chunk_size == Some(0) {
            return Err(ConfigError::ZeroChunkSize);
        }

        validate_table(&self.target.name)?;
        validate_identifier(&self.target.key_column)?;
        for attribute in &self.target.fillable {
            validate_identifier(attribute)?;
        }

        for mapping in &self.fields {
            if mapping.source.trim().is_empty() || mapping.target.trim().is_empty() {
                return Err(ConfigError::EmptyMapping(mapping.source.clone()));
            }
            validate_identifier(&mapping.target)?;
            if let Some(transform) = &mapping.transform {
                if !transforms.contains(&transform.name) {
                    return Err(ConfigError::UnknownTransform {
                        field: mapping.source.clone(),
                        name: transform.name.clone(),
                    });
                }
            }
        }

        for relation in &self.relations {
            let invalid = |reason: String| ConfigError::InvalidRelation {
                field: relation.source.clone(),
                reason,
            };
            if relation.source.trim().is_empty() {
                return Err(invalid("source field is empty".to_string()));
            }
            validate_identifier(&relation.foreign_key).map_err(|e| invalid(e.to_string()))?;
            validate_table(&relation.related).map_err(|e| invalid(e.to_string()))?;
            validate_identifier(&relation.related_key).map_err(|e| invalid(e.to_string()))?;
            validate_identifier(&relation.lookup_column).map_err(|e| invalid(e.to_string()))?;
        }

        if let Some(policy) = &self.duplicate {
            if self.key_mapping().is_none() {
                return Err(ConfigError::UnmappedDuplicateKey(policy.key_attribute.clone()));
            }
        }

        for field_rules in self.effective_rules() {
            field_rules.validate()?;
        }

        Ok(())
    }
}

/// Builder for [`IngestConfig`]
pub struct IngestConfigBuilder {
    config: IngestConfig,
}

impl IngestConfigBuilder {
    pub fn field(mut self, mapping: FieldMapping) -> Self {
        self.config.fields.push(mapping);
        self
    }

    pub fn relation(mut self, rule: RelationRule) -> Self {
        self.config.relations.push(rule);
        self
    }

    pub fn duplicate(mut self, key_attribute: impl Into<String>, strategy: DuplicateStrategy) -> Self {
        self.config.duplicate = Some(DuplicatePolicy {
            key_attribute: key_attribute.into(),
            strategy,
        });
        self
    }

    pub fn validate_field(mut self, field: impl Into<String>, rules: Vec<ValidationRule>) -> Self {
        self.config.validation.push(FieldRules::new(field, rules));
        self
    }

    pub fn use_entity_rules(mut self, enabled: bool) -> Self {
        self.config.use_entity_rules = enabled;
        self
    }

    pub fn copy_fillable(mut self, enabled: bool) -> Self {
        self.config.copy_fillable = enabled;
        self
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunk_size = Some(size);
        self
    }

    pub fn transaction_mode(mut self, mode: TransactionMode) -> Self {
        self.config.transaction_mode = mode;
        self
    }

    pub fn log_rows(mut self, enabled: bool) -> Self {
        self.config.log_rows = enabled;
        self
    }

    pub fn build(self) -> IngestConfig {
        self.config
    }
}

pub(crate) fn validate_identifier(name: &str) -> Result<(), ConfigError> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(ConfigError::InvalidIdentifier(name.to_string()))
    }
}

/// Tables may be schema-qualified (`schema.table`)
pub(crate) fn validate_table(name: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 {
        return Err(ConfigError::InvalidIdentifier(name.to_string()));
    }
    parts.into_iter().try_for_each(validate_identifier)
}

/// Find a header in `row`: exact match first, then trimmed case-insensitive
pub fn resolve_header<'r>(row: &'r RowData, names: &[&str]) -> Option<(&'r String, &'r Value)> {
    for name in names {
        if let Some(entry) = row.get_key_value(*name) {
            return Some(entry);
        }
    }
    for name in names {
        let wanted = name.trim().to_lowercase();
        if let Some(entry) = row.iter().find(|(key, _)| key.trim().to_lowercase() == wanted) {
            return Some(entry);
        }
    }
    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn products() -> IngestConfigBuilder {
        IngestConfig::builder("products", "memory", TargetEntity::new("products"))
            .field(FieldMapping::new("sku", "sku").alias("SKU Code"))
            .field(FieldMapping::new("name", "name").transform("trim"))
    }

    #[test]
    fn test_valid_config_passes() {
        let config = products().duplicate("sku", DuplicateStrategy::Skip).build();
        assert!(config.validate(&TransformRegistry::default()).is_ok());
        assert_eq!(config.key_mapping().unwrap().source, "sku");
    }

    #[test]
    fn test_unknown_transform_is_rejected() {
        let config = products()
            .field(FieldMapping::new("price", "price").transform("to_money"))
            .build();
        assert_eq!(
            config.validate(&TransformRegistry::default()),
            Err(ConfigError::UnknownTransform {
                field: "price".into(),
                name: "to_money".into()
            })
        );
    }

    #[test]
    fn test_unmapped_duplicate_key_is_rejected() {
        let config = products().duplicate("barcode", DuplicateStrategy::Update).build();
        assert_eq!(
            config.validate(&TransformRegistry::default()),
            Err(ConfigError::UnmappedDuplicateKey("barcode".into()))
        );
    }

    #[test]
    fn test_bad_relation_target_is_rejected() {
        let config = products()
            .relation(RelationRule::new("brand", "brand_id", "brands; drop", "name"))
            .build();
        assert!(matches!(
            config.validate(&TransformRegistry::default()),
            Err(ConfigError::InvalidRelation { .. })
        ));
    }

    #[test]
    fn test_zero_chunk_size_is_rejected() {
        let config = products().chunk_size(0).build();
        assert_eq!(
            config.validate(&TransformRegistry::default()),
            Err(ConfigError::ZeroChunkSize)
        );
    }

    #[test]
    fn test_schema_qualified_tables() {
        assert!(validate_table("catalog.products").is_ok());
        assert!(validate_table("a.b.c").is_err());
        assert!(validate_table("products\"").is_err());
    }

    #[test]
    fn test_header_names_cover_source_and_target() {
        let config = IngestConfig::builder("people", "memory", TargetEntity::new("people"))
            .field(FieldMapping::new("E-Mail", "email").alias("mail"))
            .build();
        assert_eq!(config.header_names_for("email"), vec!["email", "E-Mail", "mail"]);
    }

    #[test]
    fn test_resolve_header_falls_back_to_case_insensitive() {
        let row = json!({ " SKU Code ": "A-1", "name": "Widget" });
        let row = row.as_object().unwrap();

        let (key, value) = resolve_header(row, &["sku", "SKU Code"]).unwrap();
        assert_eq!(key, " SKU Code ");
        assert_eq!(value, "A-1");
        assert!(resolve_header(row, &["price"]).is_none());
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: IngestConfig = serde_json::from_value(json!({
            "importer": "products",
            "source_type": "memory",
            "target": { "name": "products" },
            "fields": [{ "source": "sku", "target": "sku" }],
            "duplicate": { "key_attribute": "sku", "strategy": "fail" },
            "transaction_mode": "chunk"
        }))
        .unwrap();

        assert!(config.log_rows);
        assert_eq!(config.target.key_column, "id");
        assert_eq!(config.transaction_mode, TransactionMode::Chunk);
        assert_eq!(config.duplicate.unwrap().strategy, DuplicateStrategy::Fail);
    }
}
