//! Importer definitions and the registry that validates them

pub mod definition;
pub mod transform;
pub mod validation;

pub use definition::{
    resolve_header, DuplicatePolicy, DuplicateStrategy, FieldMapping, IngestConfig,
    IngestConfigBuilder, RelationRule, TargetEntity, TransactionMode, TransformRef,
};
pub use transform::{TransformFn, TransformRegistry};
pub use validation::{FieldRules, ValidationRule, Validator};

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::{ConfigError, IngestError, Result};

/// Validated importer configurations, keyed by importer id
#[derive(Debug, Clone)]
pub struct ImporterRegistry {
    importers: HashMap<String, Arc<IngestConfig>>,
    transforms: Arc<TransformRegistry>,
}

impl ImporterRegistry {
    pub fn new(transforms: TransformRegistry) -> Self {
        Self {
            importers: HashMap::new(),
            transforms: Arc::new(transforms),
        }
    }

    /// Register an importer; configuration errors surface here, before any
    /// run exists
    pub fn register(&mut self, config: IngestConfig) -> std::result::Result<(), ConfigError> {
        config.validate(&self.transforms)?;
        if self.importers.contains_key(&config.importer) {
            return Err(ConfigError::DuplicateImporter(config.importer));
        }
        tracing::debug!(importer = %config.importer, target = %config.target.name, "Registered importer");
        self.importers.insert(config.importer.clone(), Arc::new(config));
        Ok(())
    }

    /// Load importer definitions from a JSON array file
    pub fn load_json_file(&mut self, path: &Path) -> Result<usize> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::InvalidSetting {
                name: path.display().to_string(),
                reason: e.to_string(),
            }
        })?;
        let configs: Vec<IngestConfig> =
            serde_json::from_str(&content).map_err(|e| ConfigError::InvalidSetting {
                name: path.display().to_string(),
                reason: e.to_string(),
            })?;

        let count = configs.len();
        for config in configs {
            self.register(config)?;
        }
        Ok(count)
    }

    pub fn get(&self, importer: &str) -> Result<Arc<IngestConfig>> {
        self.importers
            .get(importer)
            .cloned()
            .ok_or_else(|| IngestError::UnknownImporter(importer.to_string()))
    }

    pub fn transforms(&self) -> &Arc<TransformRegistry> {
        &self.transforms
    }

    pub fn len(&self) -> usize {
        self.importers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.importers.is_empty()
    }
}

impl Default for ImporterRegistry {
    fn default() -> Self {
        Self::new(TransformRegistry::default())
    }
}
