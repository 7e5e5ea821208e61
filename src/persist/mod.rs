//! Durable storage for enriched records.

pub mod sqlite;

use thiserror::Error;

use crate::spot::EnrichedRecord;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{0}")]
    Message(String),
}

pub type PersistResult<T> = Result<T, PersistError>;

/// What one [`PersistenceSink::commit`] changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitReport {
    /// Rows written from the batch.
    pub inserted: usize,
    /// Rows removed for falling out of the retention window.
    pub evicted: usize,
}

/// Destination for flushed batches.
///
/// `commit` must be atomic: either the whole batch is written and the
/// expired rows are gone, or nothing changed.
pub trait PersistenceSink: Send {
    /// Write `batch` and delete every row with `timestamp <= evict_before`.
    fn commit(&mut self, batch: &[EnrichedRecord], evict_before: f64)
    -> PersistResult<CommitReport>;
}
