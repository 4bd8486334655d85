//! Chunks: the unit of dispatch

use serde::Serialize;
use uuid::Uuid;

use crate::repository::CounterDelta;
use crate::types::RowData;

/// A source row with its 1-based position in the source
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRow {
    pub row_number: u64,
    pub data: RowData,
}

/// Consecutive source rows processed as one unit of work
#[derive(Debug, Clone)]
pub struct Chunk {
    pub run_id: Uuid,
    /// 0-based position of the chunk within its run
    pub index: usize,
    pub rows: Vec<ChunkRow>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn first_row(&self) -> Option<u64> {
        self.rows.first().map(|r| r.row_number)
    }
}

/// Outcome counts of one chunk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChunkTally {
    pub processed: u64,
    pub successful: u64,
    pub failed: u64,
}

impl ChunkTally {
    pub fn record(&mut self, success: bool) {
        self.processed += 1;
        if success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
    }

    pub fn merge(&mut self, other: ChunkTally) {
        self.processed += other.processed;
        self.successful += other.successful;
        self.failed += other.failed;
    }
}

impl From<ChunkTally> for CounterDelta {
    fn from(tally: ChunkTally) -> Self {
        let clamp = |n: u64| i64::try_from(n).unwrap_or(i64::MAX);
        CounterDelta {
            processed: clamp(tally.processed),
            successful: clamp(tally.successful),
            failed: clamp(tally.failed),
        }
    }
}

/// Groups a row sequence into chunks of `size` consecutive rows
#[derive(Debug)]
pub struct Chunker {
    run_id: Uuid,
    size: usize,
    next_row: u64,
    next_index: usize,
    current: Vec<ChunkRow>,
}

impl Chunker {
    pub fn new(run_id: Uuid, size: usize) -> Self {
        let size = size.max(1);
        Self {
            run_id,
            size,
            next_row: 1,
            next_index: 0,
            current: Vec::with_capacity(size),
        }
    }

    /// Rows seen so far
    pub fn rows_seen(&self) -> u64 {
        self.next_row - 1
    }

    /// Add the next row; returns a chunk once `size` rows have accumulated
    pub fn push(&mut self, data: RowData) -> Option<Chunk> {
        self.current.push(ChunkRow {
            row_number: self.next_row,
            data,
        });
        self.next_row += 1;
        if self.current.len() == self.size {
            self.take()
        } else {
            None
        }
    }

    /// The trailing partial chunk, if any, once the source is exhausted
    pub fn flush(&mut self) -> Option<Chunk> {
        self.take()
    }

    fn take(&mut self) -> Option<Chunk> {
        if self.current.is_empty() {
            return None;
        }
        let rows = std::mem::replace(&mut self.current, Vec::with_capacity(self.size));
        let chunk = Chunk {
            run_id: self.run_id,
            index: self.next_index,
            rows,
        };
        self.next_index += 1;
        Some(chunk)
    }
}
