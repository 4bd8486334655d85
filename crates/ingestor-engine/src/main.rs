//! Ingestor - operator tool for ingestion runs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ingestor_common::logging::{init_logging, LogConfig, LogLevel};
use ingestor_engine::repository::PgRunRepository;
use ingestor_engine::{
    Actor, EngineConfig, ImporterRegistry, IngestEngine, RunHandle, SourceRegistry,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "ingestor")]
#[command(author, version, about = "Ingestion run operator tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply database migrations
    Migrate,

    /// Show a run's status and counters
    Status {
        run_id: Uuid,
    },

    /// Aggregate a run's logged row failures
    Errors {
        run_id: Uuid,

        /// Maximum reasons per group
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Finalize a run left in processing
    Finalize {
        run_id: Uuid,
    },

    /// Retry a run's failed rows
    Retry {
        run_id: Uuid,

        /// JSON file with importer definitions
        #[arg(short, long)]
        importers: PathBuf,

        /// Validate and count without persisting
        #[arg(long)]
        dry_run: bool,

        /// Acting user id
        #[arg(long)]
        user: Option<Uuid>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("ingestor")
        .build()
        // Environment variables take precedence
        .merge_env()?;

    let _log_guard = init_logging(&log_config)?;

    let config = EngineConfig::load()?;
    let pool = config
        .database
        .connect()
        .await
        .context("Failed to connect to database")?;

    let mut importers = ImporterRegistry::default();
    if let Command::Retry { importers: path, .. } = &cli.command {
        let count = importers
            .load_json_file(path)
            .with_context(|| format!("Failed to load importers from {}", path.display()))?;
        info!(count, path = %path.display(), "Loaded importer definitions");
    }

    match cli.command {
        Command::Migrate => {
            PgRunRepository::new(Arc::new(pool)).migrate().await?;
            info!("Migrations applied");
        },
        Command::Status { run_id } => {
            let engine = engine(pool, importers, &config)?;
            let run = engine.run(run_id).await?;
            let progress = run.progress();
            info!(
                %run_id,
                importer = %run.importer,
                status = %run.status,
                total = ?run.total_rows,
                processed = run.processed_rows,
                successful = run.successful_rows,
                failed = run.failed_rows,
                completion = ?progress.completion_percentage(),
                error = ?run.error(),
                "Run status"
            );
        },
        Command::Errors { run_id, limit } => {
            let engine = engine(pool, importers, &config)?;
            let analysis = engine.analyze_errors(run_id, limit).await?;
            info!(
                %run_id,
                rows = analysis.rows_scanned,
                skipped = analysis.skipped,
                "Failure analysis"
            );
            for reason in &analysis.messages {
                info!(count = reason.count, message = %reason.key, "Error");
            }
            for reason in &analysis.fields {
                info!(count = reason.count, field = %reason.key, "Field error");
            }
        },
        Command::Finalize { run_id } => {
            let engine = engine(pool, importers, &config)?;
            let run = engine.finalize(run_id).await?;
            info!(%run_id, status = %run.status, "Run finalized");
        },
        Command::Retry {
            run_id,
            dry_run,
            user,
            ..
        } => {
            let engine = engine(pool, importers, &config)?;
            let actor = user.map(Actor::user).unwrap_or_default();
            let handle: RunHandle = engine.retry(run_id, actor, dry_run).await?;
            info!(original = %run_id, retry = %handle.id(), dry_run, "Retry started");
            let run = handle.wait().await?;
            info!(
                retry = %run.id,
                status = %run.status,
                successful = run.successful_rows,
                failed = run.failed_rows,
                "Retry finished"
            );
        },
    }

    Ok(())
}

fn engine(
    pool: sqlx::PgPool,
    importers: ImporterRegistry,
    config: &EngineConfig,
) -> Result<IngestEngine> {
    Ok(IngestEngine::postgres(
        pool,
        importers,
        SourceRegistry::default(),
        config.ingest,
    )?)
}
