//! Run dispatch
//!
//! `start` creates the run, reads the first source row (key column check,
//! empty-source fast path) and hands the rest to a supervisor task. The
//! supervisor pulls chunks from the source as permits of a semaphore free up,
//! runs them on a [`JoinSet`] and finalizes once every dispatched chunk has
//! been joined. The join loop is the completion barrier; counter values are
//! never used to decide that a run is done.

use futures::TryStreamExt;
use ingestor_common::render_error;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::aggregator::RunAggregator;
use super::chunk::{Chunk, ChunkTally, Chunker};
use super::processor::RowProcessor;
use crate::config::IngestSettings;
use crate::error::{IngestError, Result, SourceError};
use crate::importer::{resolve_header, ImporterRegistry, IngestConfig};
use crate::repository::RunRepository;
use crate::source::{RowSource, RowStream, SourcePayload, SourceRegistry};
use crate::store::EntityStore;
use crate::types::{Actor, CreateRunParams, IngestRun, RowData, RunStart, RunStatus};

/// Capacity of the run event channel; slow subscribers observe `Lagged`
const EVENT_CHANNEL_CAPACITY: usize = 256;

const CANCELLED_MESSAGE: &str = "Run was cancelled";

/// Run lifecycle notification
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    Started {
        run_id: Uuid,
        /// Row count reported by the source; `None` for unbounded streams
        total_rows: Option<u64>,
    },
    ChunkCompleted {
        run_id: Uuid,
        chunk: usize,
        tally: ChunkTally,
    },
    Completed {
        run_id: Uuid,
        status: RunStatus,
    },
    Failed {
        run_id: Uuid,
        error: String,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            RunEvent::Started { run_id, .. }
            | RunEvent::ChunkCompleted { run_id, .. }
            | RunEvent::Completed { run_id, .. }
            | RunEvent::Failed { run_id, .. } => *run_id,
        }
    }
}

/// A started run and, when chunks were dispatched, its completion
pub struct RunHandle {
    run: IngestRun,
    completion: Option<JoinHandle<Result<IngestRun>>>,
}

impl RunHandle {
    fn completed(run: IngestRun) -> Self {
        Self {
            run,
            completion: None,
        }
    }

    /// The run as it was when `start` returned
    pub fn run(&self) -> &IngestRun {
        &self.run
    }

    pub fn id(&self) -> Uuid {
        self.run.id
    }

    /// Whether chunk work is running in the background
    pub fn is_dispatched(&self) -> bool {
        self.completion.is_some()
    }

    /// Wait for the run to reach a terminal state
    pub async fn wait(self) -> Result<IngestRun> {
        match self.completion {
            None => Ok(self.run),
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(join_err) => Err(IngestError::Worker(join_err.to_string())),
            },
        }
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.run.id)
            .field("status", &self.run.status)
            .field("dispatched", &self.is_dispatched())
            .finish()
    }
}

/// Cancellation tokens of runs dispatched by this process
#[derive(Default)]
struct CancellationTokens {
    tokens: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl CancellationTokens {
    async fn insert(&self, run_id: Uuid, token: CancellationToken) {
        self.tokens.lock().await.insert(run_id, token);
    }

    async fn get(&self, run_id: Uuid) -> Option<CancellationToken> {
        self.tokens.lock().await.get(&run_id).cloned()
    }

    async fn remove(&self, run_id: Uuid) {
        self.tokens.lock().await.remove(&run_id);
    }
}

/// Everything a supervisor and its chunk tasks need
#[derive(Clone)]
struct RunContext {
    run_id: Uuid,
    processor: Arc<RowProcessor>,
    aggregator: RunAggregator,
    events: broadcast::Sender<RunEvent>,
    tokens: Arc<CancellationTokens>,
    token: CancellationToken,
    max_concurrent_chunks: usize,
    recount: bool,
    dry_run: bool,
}

impl RunContext {
    fn emit(&self, event: RunEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Splits sources into chunks and dispatches them
pub struct ChunkOrchestrator {
    importers: Arc<ImporterRegistry>,
    sources: Arc<SourceRegistry>,
    store: Arc<dyn EntityStore>,
    repository: Arc<dyn RunRepository>,
    aggregator: RunAggregator,
    settings: IngestSettings,
    tokens: Arc<CancellationTokens>,
    events: broadcast::Sender<RunEvent>,
}

impl ChunkOrchestrator {
    pub fn new(
        importers: Arc<ImporterRegistry>,
        sources: Arc<SourceRegistry>,
        store: Arc<dyn EntityStore>,
        repository: Arc<dyn RunRepository>,
        settings: IngestSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let aggregator = RunAggregator::new(repository.clone(), settings.error_rendering);
        Self {
            importers,
            sources,
            store,
            repository,
            aggregator,
            settings,
            tokens: Arc::new(CancellationTokens::default()),
            events,
        }
    }

    pub fn aggregator(&self) -> &RunAggregator {
        &self.aggregator
    }

    pub fn importers(&self) -> &ImporterRegistry {
        &self.importers
    }

    pub fn repository(&self) -> &Arc<dyn RunRepository> {
        &self.repository
    }

    /// Receive lifecycle events of runs started after this call
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Create a run for `importer` and dispatch its chunks
    ///
    /// Returns once the work is scheduled. An empty source completes the run
    /// before returning. Source errors fail the run and are returned here.
    #[tracing::instrument(skip(self, payload, actor))]
    pub async fn start(
        &self,
        importer: &str,
        payload: SourcePayload,
        actor: Actor,
        dry_run: bool,
    ) -> Result<RunHandle> {
        let config = self.importers.get(importer)?;
        if !self.sources.contains(&config.source_type) {
            return Err(IngestError::UnknownSourceType(config.source_type.clone()));
        }

        let mut params = CreateRunParams::new(importer, actor);
        params.original_filename = payload.original_name.clone();
        params.summary = json!({ "dry_run": dry_run });
        let run = self.repository.create_run(params).await?;
        tracing::info!(run_id = %run.id, dry_run, "Run created");

        let source = self.sources.open(&config.source_type, &payload);
        self.launch(run, config, source, dry_run).await
    }

    /// Open `source` for an existing run and dispatch its chunks
    pub(crate) async fn launch(
        &self,
        run: IngestRun,
        config: Arc<IngestConfig>,
        source: Result<Box<dyn RowSource>>,
        dry_run: bool,
    ) -> Result<RunHandle> {
        let run_id = run.id;
        let mut source = match source {
            Ok(source) => source,
            Err(err) => return Err(self.abort(run_id, err).await),
        };

        let chunk_size = config.chunk_size_or(self.settings.default_chunk_size);
        let reader = match ChunkReader::open(run_id, &config, source.as_mut(), chunk_size).await {
            Ok(reader) => reader,
            Err(err) => {
                source.cleanup().await;
                return Err(self.abort(run_id, err).await);
            },
        };

        let reported_rows = source.total_row_count();
        let batch_id = Uuid::new_v4();
        let start = RunStart {
            batch_id: Some(batch_id.to_string()),
            total_rows: reported_rows.map(|n| i64::try_from(n).unwrap_or(i64::MAX)),
            processed_filepath: source.processed_location(),
        };
        let run = match self.aggregator.begin(run_id, start).await {
            Ok(run) => run,
            Err(err) => {
                source.cleanup().await;
                return Err(self.abort(run_id, err).await);
            },
        };

        let _ = self.events.send(RunEvent::Started {
            run_id,
            total_rows: reported_rows,
        });

        if reader.is_empty() {
            drop(reader);
            source.cleanup().await;
            self.aggregator.record_chunks(run_id, 0).await?;
            let run = self.aggregator.finalize(run_id, config.log_rows).await?;
            let _ = self.events.send(RunEvent::Completed {
                run_id,
                status: run.status,
            });
            return Ok(RunHandle::completed(run));
        }

        tracing::info!(%run_id, %batch_id, reported_rows = ?reported_rows, chunk_size, "Dispatching chunks");

        let token = CancellationToken::new();
        self.tokens.insert(run_id, token.clone()).await;

        let context = RunContext {
            run_id,
            processor: Arc::new(RowProcessor::new(
                config.clone(),
                self.importers.transforms().clone(),
                self.store.clone(),
                self.repository.clone(),
                self.settings.relation_lookup_batch,
            )),
            aggregator: self.aggregator.clone(),
            events: self.events.clone(),
            tokens: self.tokens.clone(),
            token,
            max_concurrent_chunks: self.settings.max_concurrent_chunks.max(1),
            recount: config.log_rows,
            dry_run,
        };
        let completion = tokio::spawn(supervise(context, reader, source, reported_rows));

        Ok(RunHandle {
            run,
            completion: Some(completion),
        })
    }

    /// Request cancellation of a run
    ///
    /// Chunks that have not started become no-ops and no further rows are
    /// read; running chunks finish. A run whose every chunk had already
    /// started still completes normally. Returns `false` when the run is
    /// already terminal.
    pub async fn cancel(&self, run_id: Uuid) -> Result<bool> {
        if let Some(token) = self.tokens.get(run_id).await {
            token.cancel();
            tracing::info!(%run_id, "Cancellation requested");
            return Ok(true);
        }

        // Not dispatched by this process
        let run = self.aggregator.run(run_id).await?;
        if run.is_terminal() {
            return Ok(false);
        }
        self.aggregator
            .fail_with_message(run_id, CANCELLED_MESSAGE, cancelled_patch())
            .await?;
        let _ = self.events.send(RunEvent::Failed {
            run_id,
            error: CANCELLED_MESSAGE.to_string(),
        });
        Ok(true)
    }

    /// Fail the run with `err` and hand the error back for the caller
    async fn abort(&self, run_id: Uuid, err: IngestError) -> IngestError {
        if let Err(fail_err) = self.aggregator.fail(run_id, &err, Map::new()).await {
            tracing::error!(%run_id, error = %fail_err, "Could not mark run failed");
        }
        let _ = self.events.send(RunEvent::Failed {
            run_id,
            error: render_error(&err, self.aggregator.rendering()),
        });
        err
    }
}

fn cancelled_patch() -> Map<String, Value> {
    let mut patch = Map::new();
    patch.insert("cancelled".to_string(), Value::Bool(true));
    patch
}

/// Fail fast when the duplicate-key column is absent from the first row
fn check_key_column(config: &IngestConfig, first_row: &RowData) -> Result<()> {
    if let Some(mapping) = config.key_mapping() {
        let names: Vec<&str> = mapping.header_names().collect();
        if resolve_header(first_row, &names).is_none() {
            return Err(SourceError::MissingKeyColumn(mapping.source.clone()).into());
        }
    }
    Ok(())
}

/// Pulls chunks from a source row stream on demand
struct ChunkReader {
    stream: RowStream,
    chunker: Chunker,
    /// Chunk completed by the first row when the chunk size is 1
    pending: Option<Chunk>,
    exhausted: bool,
}

impl ChunkReader {
    /// Start reading and check the first row
    async fn open(
        run_id: Uuid,
        config: &IngestConfig,
        source: &mut dyn RowSource,
        chunk_size: usize,
    ) -> Result<Self> {
        let mut stream = source.read(config).await?;
        let mut chunker = Chunker::new(run_id, chunk_size);
        let mut pending = None;
        let mut exhausted = false;

        match stream.try_next().await? {
            Some(first) => {
                check_key_column(config, &first)?;
                pending = chunker.push(first);
            },
            None => exhausted = true,
        }

        Ok(Self {
            stream,
            chunker,
            pending,
            exhausted,
        })
    }

    fn is_empty(&self) -> bool {
        self.exhausted && self.chunker.rows_seen() == 0
    }

    fn rows_seen(&self) -> u64 {
        self.chunker.rows_seen()
    }

    /// Next full chunk, the trailing partial chunk, or `None` once drained
    async fn next_chunk(&mut self) -> std::result::Result<Option<Chunk>, SourceError> {
        if let Some(chunk) = self.pending.take() {
            return Ok(Some(chunk));
        }
        if self.exhausted {
            return Ok(self.chunker.flush());
        }
        while let Some(row) = self.stream.try_next().await? {
            if let Some(chunk) = self.chunker.push(row) {
                return Ok(Some(chunk));
            }
        }
        self.exhausted = true;
        Ok(self.chunker.flush())
    }
}

/// What a dispatched chunk did
enum ChunkRun {
    Processed,
    /// Cancelled or terminal run; nothing was written
    Skipped,
}

/// Join results folded by the supervisor
#[derive(Default)]
struct Supervision {
    first_error: Option<IngestError>,
    skipped: usize,
}

impl Supervision {
    async fn observe(
        &mut self,
        ctx: &RunContext,
        joined: std::result::Result<Result<ChunkRun>, JoinError>,
    ) {
        let outcome = joined.unwrap_or_else(|join_err| Err(IngestError::Worker(join_err.to_string())));
        match outcome {
            Ok(ChunkRun::Processed) => {},
            Ok(ChunkRun::Skipped) => self.skipped += 1,
            Err(err) => self.record_error(ctx, err).await,
        }
    }

    /// Fail the run on the first error and stop the remaining chunks
    async fn record_error(&mut self, ctx: &RunContext, err: IngestError) {
        if self.first_error.is_some() {
            tracing::warn!(run_id = %ctx.run_id, error = %err, "Additional chunk failure");
            return;
        }
        if let Err(fail_err) = ctx.aggregator.fail(ctx.run_id, &err, Map::new()).await {
            tracing::error!(run_id = %ctx.run_id, error = %fail_err, "Could not mark run failed");
        }
        ctx.token.cancel();
        self.first_error = Some(err);
    }
}

#[tracing::instrument(skip_all, fields(run_id = %ctx.run_id))]
async fn supervise(
    ctx: RunContext,
    mut reader: ChunkReader,
    mut source: Box<dyn RowSource>,
    reported_rows: Option<u64>,
) -> Result<IngestRun> {
    let run_id = ctx.run_id;
    let semaphore = Arc::new(Semaphore::new(ctx.max_concurrent_chunks));
    let mut tasks = JoinSet::new();
    let mut supervision = Supervision::default();
    let mut dispatched = 0_usize;
    let mut stopped_early = false;

    loop {
        while let Some(joined) = tasks.try_join_next() {
            supervision.observe(&ctx, joined).await;
        }

        let next = tokio::select! {
            biased;
            next = reader.next_chunk() => next,
            () = ctx.token.cancelled() => {
                stopped_early = true;
                break;
            },
        };
        let chunk = match next {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(err) => {
                supervision.record_error(&ctx, err.into()).await;
                break;
            },
        };

        // A permit per running chunk bounds both concurrency and buffered rows
        let permit = tokio::select! {
            biased;
            () = ctx.token.cancelled() => {
                stopped_early = true;
                break;
            },
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(e) => {
                    let err = IngestError::Worker(format!("Chunk semaphore closed: {e}"));
                    supervision.record_error(&ctx, err).await;
                    break;
                },
            },
        };

        dispatched += 1;
        let chunk_ctx = ctx.clone();
        tasks.spawn(async move {
            let _permit = permit;
            run_chunk(&chunk_ctx, chunk).await
        });
    }

    let rows_read = reader.rows_seen();
    drop(reader);
    if !stopped_early && supervision.first_error.is_none() {
        if let Some(reported) = reported_rows.filter(|reported| *reported != rows_read) {
            tracing::warn!(reported, counted = rows_read, "Source row count differs from rows read");
        }
    }
    if let Err(err) = ctx.aggregator.record_chunks(run_id, dispatched).await {
        tracing::warn!(error = %err, "Could not record chunk count");
    }

    while let Some(joined) = tasks.join_next().await {
        supervision.observe(&ctx, joined).await;
    }

    source.cleanup().await;
    ctx.tokens.remove(run_id).await;

    if let Some(err) = supervision.first_error {
        ctx.emit(RunEvent::Failed {
            run_id,
            error: render_error(&err, ctx.aggregator.rendering()),
        });
        return Err(err);
    }

    // Only a cancellation that actually left work undone fails the run
    if stopped_early || supervision.skipped > 0 {
        let run = ctx
            .aggregator
            .fail_with_message(run_id, CANCELLED_MESSAGE, cancelled_patch())
            .await?;
        ctx.emit(RunEvent::Failed {
            run_id,
            error: CANCELLED_MESSAGE.to_string(),
        });
        return Ok(run);
    }

    let run = ctx.aggregator.finalize(run_id, ctx.recount).await?;
    ctx.emit(RunEvent::Completed {
        run_id,
        status: run.status,
    });
    Ok(run)
}

async fn run_chunk(ctx: &RunContext, chunk: Chunk) -> Result<ChunkRun> {
    if ctx.token.is_cancelled() {
        tracing::debug!(run_id = %ctx.run_id, chunk = chunk.index, "Skipping chunk of cancelled run");
        return Ok(ChunkRun::Skipped);
    }
    if ctx.aggregator.run(ctx.run_id).await?.is_terminal() {
        tracing::debug!(run_id = %ctx.run_id, chunk = chunk.index, "Skipping chunk of terminal run");
        return Ok(ChunkRun::Skipped);
    }

    let tally = ctx.processor.process_chunk(&chunk, ctx.dry_run).await?;
    ctx.aggregator.increment(ctx.run_id, tally).await?;
    ctx.emit(RunEvent::ChunkCompleted {
        run_id: ctx.run_id,
        chunk: chunk.index,
        tally,
    });
    Ok(ChunkRun::Processed)
}
