//! Test helpers for engine integration tests
//!
//! Builds engines over the in-memory run repository and entity store, keeping
//! handles to both so tests can inspect what a run persisted.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use ingestor_engine::error::{SourceError, StoreError};
use ingestor_engine::importer::{IngestConfigBuilder, ValidationRule};
use ingestor_engine::source::{InMemorySource, RowStream};
use ingestor_engine::store::{EntityId, EntitySession};
use ingestor_engine::types::Attributes;
use ingestor_engine::{
    EntityStore, FieldMapping, ImporterRegistry, InMemoryEntityStore, InMemoryRunRepository,
    IngestConfig, IngestEngine, IngestSettings, RowSource, SourcePayload, SourceRegistry,
    TargetEntity,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};

/// Source type whose cleanups are counted by [`TestEngine::cleanups`]
pub const COUNTING_SOURCE: &str = "counting";

/// Source type producing `E1, E2, ...` forever, with no known row count
pub const ENDLESS_SOURCE: &str = "endless";

/// Engine plus the stores behind it
pub struct TestEngine {
    pub engine: IngestEngine,
    pub store: InMemoryEntityStore,
    pub repo: Arc<InMemoryRunRepository>,
    cleanups: Arc<AtomicUsize>,
}

impl TestEngine {
    pub fn new(configs: Vec<IngestConfig>) -> Self {
        Self::with_settings(configs, IngestSettings::default())
    }

    pub fn with_settings(configs: Vec<IngestConfig>, settings: IngestSettings) -> Self {
        Self::sharing(
            configs,
            settings,
            InMemoryEntityStore::new(),
            Arc::new(InMemoryRunRepository::new()),
        )
    }

    /// Engine over existing stores, e.g. to retry with a corrected importer
    pub fn sharing(
        configs: Vec<IngestConfig>,
        settings: IngestSettings,
        store: InMemoryEntityStore,
        repo: Arc<InMemoryRunRepository>,
    ) -> Self {
        let backend = Arc::new(store.clone());
        Self::build(configs, settings, store, backend, repo)
    }

    /// Engine whose first store session blocks until [`Gate::open`]
    pub fn gated(configs: Vec<IngestConfig>, settings: IngestSettings) -> (Self, Gate) {
        let store = InMemoryEntityStore::new();
        let gate = Gate {
            entered: Arc::new(Notify::new()),
            release: Arc::new(Semaphore::new(0)),
        };
        let backend = Arc::new(GatedStore {
            inner: store.clone(),
            gate: gate.clone(),
            closed: AtomicBool::new(true),
        });
        let engine = Self::build(
            configs,
            settings,
            store,
            backend,
            Arc::new(InMemoryRunRepository::new()),
        );
        (engine, gate)
    }

    fn build(
        configs: Vec<IngestConfig>,
        settings: IngestSettings,
        store: InMemoryEntityStore,
        backend: Arc<dyn EntityStore>,
        repo: Arc<InMemoryRunRepository>,
    ) -> Self {
        let mut importers = ImporterRegistry::default();
        for config in configs {
            importers.register(config).expect("importer should be valid");
        }

        let cleanups = Arc::new(AtomicUsize::new(0));
        let mut sources = SourceRegistry::default();
        let counter = cleanups.clone();
        sources.register(COUNTING_SOURCE, move |payload| {
            Ok(Box::new(CountingSource {
                inner: InMemorySource::from_payload(payload)?,
                cleanups: counter.clone(),
            }) as Box<dyn RowSource>)
        });
        sources.register(ENDLESS_SOURCE, |_payload| {
            Ok(Box::new(EndlessSource) as Box<dyn RowSource>)
        });

        let engine = IngestEngine::builder()
            .importers(importers)
            .sources(sources)
            .store(backend)
            .repository(repo.clone())
            .settings(settings)
            .build()
            .expect("engine should build");

        Self {
            engine,
            store,
            repo,
            cleanups,
        }
    }

    /// Cleanup calls made on `counting` sources
    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

/// In-memory rows with an externally visible cleanup counter
struct CountingSource {
    inner: InMemorySource,
    cleanups: Arc<AtomicUsize>,
}

#[async_trait]
impl RowSource for CountingSource {
    async fn read(&mut self, config: &IngestConfig) -> Result<RowStream, SourceError> {
        self.inner.read(config).await
    }

    fn total_row_count(&self) -> Option<u64> {
        self.inner.total_row_count()
    }

    fn processed_location(&self) -> Option<String> {
        self.inner.processed_location()
    }

    async fn cleanup(&mut self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

/// Rows `E1, E2, ...` without end
struct EndlessSource;

#[async_trait]
impl RowSource for EndlessSource {
    async fn read(&mut self, _config: &IngestConfig) -> Result<RowStream, SourceError> {
        Ok(stream::iter(1u64..)
            .map(|i| Ok(attributes(json!({ "sku": format!("E{i}"), "price": "1" }))))
            .boxed())
    }

    fn total_row_count(&self) -> Option<u64> {
        None
    }

    fn processed_location(&self) -> Option<String> {
        None
    }

    async fn cleanup(&mut self) {}
}

/// Holds the first store session of a [`TestEngine::gated`] engine
#[derive(Clone)]
pub struct Gate {
    entered: Arc<Notify>,
    release: Arc<Semaphore>,
}

impl Gate {
    /// Wait until a chunk is blocked on the gate
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn open(&self) {
        self.release.add_permits(1);
    }
}

struct GatedStore {
    inner: InMemoryEntityStore,
    gate: Gate,
    closed: AtomicBool,
}

#[async_trait]
impl EntityStore for GatedStore {
    async fn begin(&self, atomic: bool) -> Result<Box<dyn EntitySession>, StoreError> {
        if self.closed.swap(false, Ordering::SeqCst) {
            self.gate.entered.notify_one();
            self.gate.release.acquire().await.expect("gate semaphore").forget();
        }
        self.inner.begin(atomic).await
    }

    async fn lookup(
        &self,
        target: &TargetEntity,
        column: &str,
        values: &[String],
    ) -> Result<HashMap<String, EntityId>, StoreError> {
        self.inner.lookup(target, column, values).await
    }
}

/// Settings with a given concurrency and everything else default
pub fn settings(max_concurrent_chunks: usize) -> IngestSettings {
    IngestSettings {
        max_concurrent_chunks,
        ..IngestSettings::default()
    }
}

/// `products` importer: required `sku`, optional numeric `price`
pub fn products(source_type: &str) -> IngestConfigBuilder {
    IngestConfig::builder("products", source_type, TargetEntity::new("products"))
        .field(FieldMapping::new("sku", "sku").alias("SKU").transform("trim"))
        .field(FieldMapping::new("name", "name"))
        .field(FieldMapping::new("price", "price").transform("decimal"))
        .validate_field("sku", vec![ValidationRule::Required])
        .validate_field("price", vec![ValidationRule::Numeric])
}

/// Payload carrying `rows` for the in-memory sources
pub fn payload(rows: Value) -> SourcePayload {
    SourcePayload::new("products.json").option("rows", rows)
}

/// `n` valid product rows `P1..Pn`
pub fn product_rows(n: usize) -> Value {
    Value::Array(
        (1..=n)
            .map(|i| json!({ "sku": format!("P{i}"), "name": format!("Product {i}"), "price": "9.99" }))
            .collect(),
    )
}

pub fn attributes(value: Value) -> Attributes {
    value.as_object().cloned().expect("object")
}
