//! Chunked ingestion pipeline
//!
//! [`ChunkOrchestrator`] turns a source into chunks and dispatches them,
//! [`RowProcessor`] handles the rows of one chunk, [`RunAggregator`] folds
//! chunk tallies into the run and [`RetryCoordinator`] replays failed rows.

pub mod aggregator;
pub mod chunk;
pub mod orchestrator;
pub mod processor;
pub mod relation_cache;
pub mod retry;

pub use aggregator::RunAggregator;
pub use chunk::{Chunk, ChunkRow, ChunkTally, Chunker};
pub use orchestrator::{ChunkOrchestrator, RunEvent, RunHandle};
pub use processor::{RowAction, RowOutcome, RowProcessor};
pub use relation_cache::RelationCache;
pub use retry::RetryCoordinator;
