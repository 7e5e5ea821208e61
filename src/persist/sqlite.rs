//! SQLite-backed record table.
//!
//! Rows live in the `callsigns` table that the report generator reads:
//! `(zone, band, snr, timestamp, spotter)`. Each flush inserts its batch and
//! trims expired rows inside one transaction, so a reader never sees half a
//! batch or rows older than the retention window.

use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

use crate::spot::EnrichedRecord;

use super::{CommitReport, PersistResult, PersistenceSink};

/// Groups with fewer samples than this get no trend.
pub const TREND_MIN_SAMPLES: usize = 5;

/// Aggregate for one (zone, band) cell of the report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneBandSummary {
    pub zone: u8,
    pub band: u16,
    pub count: usize,
    pub mean_snr: f64,
    /// Least-squares SNR slope in dB per minute.
    pub trend: Option<f64>,
}

/// SQLite implementation of [`PersistenceSink`].
pub struct SqliteSink {
    conn: Connection,
}

impl SqliteSink {
    /// Opens or creates a SQLite database at `path`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    /// Opens an in-memory database.
    pub fn open_in_memory() -> PersistResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> PersistResult<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self { conn })
    }

    /// All rows, oldest first.
    pub fn scan(&self) -> PersistResult<Vec<EnrichedRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT zone, band, snr, timestamp, spotter FROM callsigns ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(EnrichedRecord {
                zone: row.get(0)?,
                band: row.get(1)?,
                snr: row.get(2)?,
                timestamp: row.get(3)?,
                spotter: row.get(4)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Number of rows in the table.
    pub fn count(&self) -> PersistResult<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM callsigns", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Timestamp of the oldest row, if any.
    pub fn oldest_timestamp(&self) -> PersistResult<Option<f64>> {
        let ts: Option<Option<f64>> = self
            .conn
            .query_row("SELECT MIN(timestamp) FROM callsigns", [], |row| row.get(0))
            .optional()?;
        Ok(ts.flatten())
    }

    /// Count, mean SNR and SNR trend for every (zone, band) present.
    pub fn aggregate(&self) -> PersistResult<Vec<ZoneBandSummary>> {
        let mut groups: BTreeMap<(u8, u16), Vec<(f64, i32)>> = BTreeMap::new();
        for record in self.scan()? {
            groups
                .entry((record.zone, record.band))
                .or_default()
                .push((record.timestamp, record.snr));
        }

        Ok(groups
            .into_iter()
            .map(|((zone, band), samples)| {
                let count = samples.len();
                let mean_snr =
                    samples.iter().map(|&(_, snr)| snr as f64).sum::<f64>() / count as f64;
                ZoneBandSummary {
                    zone,
                    band,
                    count,
                    mean_snr,
                    trend: trend_per_minute(&samples),
                }
            })
            .collect())
    }
}

impl PersistenceSink for SqliteSink {
    fn commit(
        &mut self,
        batch: &[EnrichedRecord],
        evict_before: f64,
    ) -> PersistResult<CommitReport> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO callsigns(zone, band, snr, timestamp, spotter) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for record in batch {
                stmt.execute(params![
                    record.zone,
                    record.band,
                    record.snr,
                    record.timestamp,
                    record.spotter,
                ])?;
            }
        }
        let evicted = tx.execute(
            "DELETE FROM callsigns WHERE timestamp <= ?1",
            params![evict_before],
        )?;
        tx.commit()?;

        Ok(CommitReport {
            inserted: batch.len(),
            evicted,
        })
    }
}

/// Slope of SNR over time, in dB per minute.
fn trend_per_minute(samples: &[(f64, i32)]) -> Option<f64> {
    if samples.len() < TREND_MIN_SAMPLES {
        return None;
    }

    // Center on the first sample so squared unix timestamps keep precision.
    let origin = samples[0].0;
    let n = samples.len() as f64;
    let mean_x = samples.iter().map(|&(t, _)| t - origin).sum::<f64>() / n;
    let mean_y = samples.iter().map(|&(_, snr)| snr as f64).sum::<f64>() / n;

    let (mut sxy, mut sxx) = (0.0, 0.0);
    for &(t, snr) in samples {
        let dx = t - origin - mean_x;
        sxy += dx * (snr as f64 - mean_y);
        sxx += dx * dx;
    }

    if sxx == 0.0 {
        return None;
    }
    Some(sxy / sxx * 60.0)
}
