//! Statistics tracking for the ingestion pipeline.
//!
//! Counters cover every place a line or record can leave the pipeline
//! (non-matching, unparseable, unknown zone, out of band, discarded under
//! backpressure) as well as what reached the durable table, so an operator
//! can see where spots go.

use hdrhistogram::Histogram;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::persist::CommitReport;
use crate::spot::EnrichedRecord;

/// Offset added to SNR values so negative readings fit the histogram.
const SNR_OFFSET: i32 = 100;

/// Thread-safe statistics collector for the pipeline.
#[derive(Debug)]
pub struct PipelineStats {
    /// Complete lines received from the feed
    pub lines_received: AtomicU64,

    /// Raw bytes received from the feed
    pub bytes_received: AtomicU64,

    /// Lines not from the target spotter or not in an accepted mode
    pub non_matching_lines: AtomicU64,

    /// Eligible lines whose fields could not be extracted
    pub parse_failures: AtomicU64,

    /// Spots whose callsign matched no zone prefix
    pub unknown_zone: AtomicU64,

    /// Spots outside every known band
    pub unclassifiable: AtomicU64,

    /// Records admitted to the window store
    pub admitted: AtomicU64,

    /// Records written to the durable table
    pub persisted: AtomicU64,

    /// Rows evicted from the durable table for age
    pub evicted: AtomicU64,

    /// Buffered records discarded because the buffer was full
    pub backpressure_drops: AtomicU64,

    /// Successful flushes
    pub flushes: AtomicU64,

    /// Failed flushes
    pub flush_failures: AtomicU64,

    /// Sessions re-established after a connection failure
    pub reconnects: AtomicU64,

    /// Histogram of admitted SNR values (offset by `SNR_OFFSET`)
    snr_histogram: RwLock<Histogram<u64>>,

    /// Admitted records per band
    records_by_band: RwLock<HashMap<u16, u64>>,

    /// Admitted records per CQ zone
    records_by_zone: RwLock<HashMap<u8, u64>>,

    /// When stats collection started
    start_time: Instant,
}

impl PipelineStats {
    /// Create a new statistics collector.
    pub fn new() -> Self {
        Self {
            lines_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            non_matching_lines: AtomicU64::new(0),
            parse_failures: AtomicU64::new(0),
            unknown_zone: AtomicU64::new(0),
            unclassifiable: AtomicU64::new(0),
            admitted: AtomicU64::new(0),
            persisted: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            backpressure_drops: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            // SNR histogram: -99..=99 dB shifted into 1..=199
            snr_histogram: RwLock::new(
                Histogram::new_with_bounds(1, 250, 2).expect("Failed to create SNR histogram"),
            ),
            records_by_band: RwLock::new(HashMap::new()),
            records_by_zone: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Record bytes received from the feed.
    pub fn record_bytes(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a complete line.
    pub fn record_line(&self) {
        self.lines_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a line that was not for us.
    pub fn record_non_matching(&self) {
        self.non_matching_lines.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a parse failure.
    pub fn record_parse_failure(&self) {
        self.parse_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a spot dropped for an unknown zone.
    pub fn record_unknown_zone(&self) {
        self.unknown_zone.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a spot dropped for an out-of-band frequency.
    pub fn record_unclassifiable(&self) {
        self.unclassifiable.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a reconnect.
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a record admitted to the store.
    pub fn record_admitted(&self, record: &EnrichedRecord) {
        self.admitted.fetch_add(1, Ordering::Relaxed);

        let snr = (record.snr + SNR_OFFSET).clamp(1, 250) as u64;
        if let Ok(mut hist) = self.snr_histogram.write() {
            let _ = hist.record(snr);
        }

        if let Ok(mut map) = self.records_by_band.write() {
            *map.entry(record.band).or_insert(0) += 1;
        }

        if let Ok(mut map) = self.records_by_zone.write() {
            *map.entry(record.zone).or_insert(0) += 1;
        }
    }

    /// Record a successful flush.
    pub fn record_flush(&self, report: &CommitReport) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.persisted
            .fetch_add(report.inserted as u64, Ordering::Relaxed);
        self.evicted
            .fetch_add(report.evicted as u64, Ordering::Relaxed);
    }

    /// Record a failed flush.
    pub fn record_flush_failure(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Bring the backpressure counter up to the store's running total.
    pub fn set_backpressure_drops(&self, total: u64) {
        self.backpressure_drops.store(total, Ordering::Relaxed);
    }

    /// Get the elapsed time since stats collection started.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Get the current admitted records per minute.
    pub fn records_per_minute(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.admitted.load(Ordering::Relaxed) as f64 / elapsed * 60.0
        } else {
            0.0
        }
    }

    /// Generate a summary report.
    pub fn summary(&self) -> StatsSummary {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        let snr_percentiles = self
            .snr_histogram
            .read()
            .ok()
            .filter(|h| !h.is_empty())
            .map(|h| SnrPercentiles {
                p50: h.value_at_quantile(0.50) as i64 - SNR_OFFSET as i64,
                p90: h.value_at_quantile(0.90) as i64 - SNR_OFFSET as i64,
                min: h.min() as i64 - SNR_OFFSET as i64,
                max: h.max() as i64 - SNR_OFFSET as i64,
                mean: h.mean() - SNR_OFFSET as f64,
            });

        let records_by_band = self
            .records_by_band
            .read()
            .map(|m| m.clone())
            .unwrap_or_default();

        let records_by_zone = self
            .records_by_zone
            .read()
            .map(|m| m.clone())
            .unwrap_or_default();

        StatsSummary {
            elapsed_secs: self.elapsed().as_secs_f64(),
            lines_received: load(&self.lines_received),
            bytes_received: load(&self.bytes_received),
            non_matching_lines: load(&self.non_matching_lines),
            parse_failures: load(&self.parse_failures),
            unknown_zone: load(&self.unknown_zone),
            unclassifiable: load(&self.unclassifiable),
            admitted: load(&self.admitted),
            persisted: load(&self.persisted),
            evicted: load(&self.evicted),
            backpressure_drops: load(&self.backpressure_drops),
            flushes: load(&self.flushes),
            flush_failures: load(&self.flush_failures),
            reconnects: load(&self.reconnects),
            records_per_minute: self.records_per_minute(),
            snr_percentiles,
            records_by_band,
            records_by_zone,
        }
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Percentile values of the SNR distribution, in dB.
#[derive(Debug, Clone, Serialize)]
pub struct SnrPercentiles {
    pub p50: i64,
    pub p90: i64,
    pub min: i64,
    pub max: i64,
    pub mean: f64,
}

/// Summary of collected statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSummary {
    pub elapsed_secs: f64,
    pub lines_received: u64,
    pub bytes_received: u64,
    pub non_matching_lines: u64,
    pub parse_failures: u64,
    pub unknown_zone: u64,
    pub unclassifiable: u64,
    pub admitted: u64,
    pub persisted: u64,
    pub evicted: u64,
    pub backpressure_drops: u64,
    pub flushes: u64,
    pub flush_failures: u64,
    pub reconnects: u64,
    pub records_per_minute: f64,
    pub snr_percentiles: Option<SnrPercentiles>,
    pub records_by_band: HashMap<u16, u64>,
    pub records_by_zone: HashMap<u8, u64>,
}

impl std::fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "═══════════════════════════════════════════════════════")?;
        writeln!(f, "                 INGESTION STATISTICS")?;
        writeln!(f, "═══════════════════════════════════════════════════════")?;
        writeln!(f)?;
        writeln!(f, "Runtime: {:.1}s", self.elapsed_secs)?;
        writeln!(f, "Lines received: {}", self.lines_received)?;
        writeln!(f, "Bytes received: {} KB", self.bytes_received / 1024)?;
        writeln!(f, "Non-matching lines: {}", self.non_matching_lines)?;
        writeln!(f, "Parse failures: {}", self.parse_failures)?;
        writeln!(f, "Unknown zone: {}", self.unknown_zone)?;
        writeln!(f, "Out of band: {}", self.unclassifiable)?;
        writeln!(
            f,
            "Admitted: {} ({:.1}/min)",
            self.admitted, self.records_per_minute
        )?;
        writeln!(
            f,
            "Persisted: {} in {} flushes ({} failed)",
            self.persisted, self.flushes, self.flush_failures
        )?;
        writeln!(f, "Evicted: {}", self.evicted)?;
        if self.backpressure_drops > 0 {
            writeln!(f, "Discarded (buffer full): {}", self.backpressure_drops)?;
        }
        writeln!(f, "Reconnects: {}", self.reconnects)?;
        writeln!(f)?;

        if let Some(ref p) = self.snr_percentiles {
            writeln!(f, "SNR Distribution (dB):")?;
            writeln!(f, "  Min: {}, Max: {}, Mean: {:.1}", p.min, p.max, p.mean)?;
            writeln!(f, "  P50: {}, P90: {}", p.p50, p.p90)?;
            writeln!(f)?;
        }

        if !self.records_by_band.is_empty() {
            writeln!(f, "Records by Band:")?;
            let mut bands: Vec<_> = self.records_by_band.iter().collect();
            bands.sort_by(|a, b| b.1.cmp(a.1));
            for (band, count) in bands {
                writeln!(f, "  {}m: {}", band, count)?;
            }
            writeln!(f)?;
        }

        if !self.records_by_zone.is_empty() {
            writeln!(f, "Top Zones:")?;
            let mut zones: Vec<_> = self.records_by_zone.iter().collect();
            zones.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
            for (i, (zone, count)) in zones.into_iter().take(10).enumerate() {
                writeln!(f, "  {}. zone {}: {}", i + 1, zone, count)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_record(zone: u8, band: u16, snr: i32) -> EnrichedRecord {
        EnrichedRecord {
            zone,
            band,
            snr,
            timestamp: 0.0,
            spotter: "VE3EID".to_string(),
        }
    }

    #[test]
    fn test_record_admitted() {
        let stats = PipelineStats::new();
        stats.record_admitted(&make_record(4, 20, -5));
        stats.record_admitted(&make_record(4, 40, -15));
        stats.record_admitted(&make_record(14, 20, 3));

        let summary = stats.summary();
        assert_eq!(summary.admitted, 3);
        assert_eq!(summary.records_by_band[&20], 2);
        assert_eq!(summary.records_by_zone[&4], 2);

        let snr = summary.snr_percentiles.unwrap();
        assert_eq!(snr.min, -15);
        assert_eq!(snr.max, 3);
    }

    #[test]
    fn test_empty_histogram_has_no_percentiles() {
        assert!(PipelineStats::new().summary().snr_percentiles.is_none());
    }

    #[test]
    fn test_flush_counters() {
        let stats = PipelineStats::new();
        stats.record_flush(&CommitReport {
            inserted: 10,
            evicted: 4,
        });
        stats.record_flush_failure();
        stats.set_backpressure_drops(7);

        let summary = stats.summary();
        assert_eq!(summary.flushes, 1);
        assert_eq!(summary.persisted, 10);
        assert_eq!(summary.evicted, 4);
        assert_eq!(summary.flush_failures, 1);
        assert_eq!(summary.backpressure_drops, 7);
    }

    #[test]
    fn test_summary_display() {
        let stats = PipelineStats::new();
        stats.record_line();
        stats.record_parse_failure();
        stats.record_admitted(&make_record(4, 20, -5));

        let text = stats.summary().to_string();
        assert!(text.contains("Lines received: 1"));
        assert!(text.contains("Parse failures: 1"));
        assert!(text.contains("20m: 1"));
        assert!(text.contains("zone 4: 1"));
    }
}
