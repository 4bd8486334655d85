//! Engine configuration

use ingestor_common::RenderingMode;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::error::{ConfigError, RepositoryError, Result};

// ============================================================================
// Database Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/ingestor";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

// ============================================================================
// Ingestion Configuration Constants
// ============================================================================

/// Default number of chunks processed at the same time.
pub const DEFAULT_MAX_CONCURRENT_CHUNKS: usize = 4;

/// Default chunk size for importers that do not declare one.
pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// Default number of distinct values per batched relation lookup.
pub const DEFAULT_RELATION_LOOKUP_BATCH: usize = 1000;

/// Engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub ingest: IngestSettings,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
}

/// Runtime knobs of the chunk pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSettings {
    pub max_concurrent_chunks: usize,
    pub default_chunk_size: usize,
    pub relation_lookup_batch: usize,
    pub error_rendering: RenderingMode,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    /// Load configuration from `.env`, the environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = EngineConfig {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                min_connections: env_or(
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                ),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
            },
            ingest: IngestSettings {
                max_concurrent_chunks: env_or(
                    "INGEST_MAX_CONCURRENT_CHUNKS",
                    DEFAULT_MAX_CONCURRENT_CHUNKS,
                ),
                default_chunk_size: env_or("INGEST_DEFAULT_CHUNK_SIZE", DEFAULT_CHUNK_SIZE),
                relation_lookup_batch: env_or(
                    "INGEST_RELATION_LOOKUP_BATCH",
                    DEFAULT_RELATION_LOOKUP_BATCH,
                ),
                error_rendering: env_or("INGEST_ERROR_RENDERING", RenderingMode::default()),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        self.ingest.validate()?;

        Ok(())
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl DatabaseConfig {
    /// Open a connection pool
    pub async fn connect(&self) -> Result<PgPool> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .acquire_timeout(Duration::from_secs(self.connect_timeout_secs))
            .connect(&self.url)
            .await
            .map_err(RepositoryError::from)?;

        tracing::info!(
            max_connections = self.max_connections,
            min_connections = self.min_connections,
            "Database connection pool created"
        );

        Ok(pool)
    }
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            max_concurrent_chunks: DEFAULT_MAX_CONCURRENT_CHUNKS,
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            relation_lookup_batch: DEFAULT_RELATION_LOOKUP_BATCH,
            error_rendering: RenderingMode::default(),
        }
    }
}

impl IngestSettings {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let positive = [
            ("max_concurrent_chunks", self.max_concurrent_chunks),
            ("default_chunk_size", self.default_chunk_size),
            ("relation_lookup_batch", self.relation_lookup_batch),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidSetting {
                    name: name.to_string(),
                    reason: "must be greater than 0".to_string(),
                });
            }
        }
        Ok(())
    }
}
