//! Time-windowed record buffer with batched flushes.
//!
//! Enriched records are admitted into an in-memory buffer. A flush is due
//! when the buffer holds `flush_count` records or `flush_interval` has passed
//! since the last flush, whichever comes first. A flush hands the whole
//! buffer to the [`PersistenceSink`] together with the retention cutoff, and
//! the sink writes the batch and drops expired rows in one transaction.
//!
//! A failed flush keeps the records for the next attempt. The buffer has a
//! hard capacity so a sink that stays down cannot exhaust memory; past it the
//! oldest unpersisted records are discarded.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::persist::{CommitReport, PersistResult, PersistenceSink};
use crate::spot::{EnrichedRecord, unix_seconds};

/// Thresholds for the window store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Flush once this many records are buffered.
    pub flush_count: usize,

    /// Flush at least this often, even with few or no records.
    pub flush_interval: Duration,

    /// Rows older than this are evicted from the durable table.
    pub retention: Duration,

    /// Hard cap on buffered, unpersisted records.
    pub max_buffered: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            flush_count: 500,
            flush_interval: Duration::from_secs(30),
            retention: Duration::from_secs(15 * 60),
            max_buffered: 10_000,
        }
    }
}

/// The current moment on both clocks the store needs: a monotonic instant
/// for the flush timer and unix seconds for the retention cutoff.
#[derive(Debug, Clone, Copy)]
pub struct Now {
    pub instant: Instant,
    pub unix: f64,
}

impl Now {
    pub fn current() -> Self {
        Self {
            instant: Instant::now(),
            unix: unix_seconds(Utc::now()),
        }
    }
}

/// Single-owner buffer of enriched records.
#[derive(Debug)]
pub struct WindowStore {
    config: StoreConfig,
    buffer: VecDeque<EnrichedRecord>,
    last_flush: Instant,
    /// Set after a failed flush; the count trigger waits for the timer.
    retry_pending: bool,
    dropped: u64,
}

impl WindowStore {
    /// Create an empty store whose flush timer starts at `started`.
    pub fn new(config: StoreConfig, started: Instant) -> Self {
        Self {
            buffer: VecDeque::with_capacity(config.flush_count.min(config.max_buffered)),
            config,
            last_flush: started,
            retry_pending: false,
            dropped: 0,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Buffered records not yet persisted.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Records discarded because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Buffered records, oldest first.
    pub fn buffered(&self) -> impl Iterator<Item = &EnrichedRecord> {
        self.buffer.iter()
    }

    /// Append a record. Returns `true` when the count trigger is now due.
    pub fn admit(&mut self, record: EnrichedRecord) -> bool {
        if self.buffer.len() >= self.config.max_buffered {
            self.buffer.pop_front();
            self.dropped += 1;
            if self.dropped == 1 || self.dropped % 1000 == 0 {
                warn!(
                    "Record buffer full ({} records); discarded {} oldest unpersisted records so far",
                    self.config.max_buffered, self.dropped
                );
            }
        }
        self.buffer.push_back(record);
        self.count_due()
    }

    fn count_due(&self) -> bool {
        !self.retry_pending && self.buffer.len() >= self.config.flush_count
    }

    /// Whether either trigger has fired at `now`.
    pub fn flush_due(&self, now: Instant) -> bool {
        self.count_due()
            || now.saturating_duration_since(self.last_flush) >= self.config.flush_interval
    }

    /// Unix time at or before which rows are evicted.
    pub fn evict_before(&self, now_unix: f64) -> f64 {
        now_unix - self.config.retention.as_secs_f64()
    }

    /// Write the buffer and evict expired rows in one commit.
    ///
    /// On success the buffer is emptied. On failure it is left intact and
    /// the next attempt waits for the time trigger.
    pub fn flush<S: PersistenceSink + ?Sized>(
        &mut self,
        now: Now,
        sink: &mut S,
    ) -> PersistResult<CommitReport> {
        let evict_before = self.evict_before(now.unix);
        self.last_flush = now.instant;
        let batch = self.buffer.make_contiguous();

        match sink.commit(batch, evict_before) {
            Ok(report) => {
                debug!(
                    "Flushed {} records, evicted {} expired rows",
                    report.inserted, report.evicted
                );
                self.buffer.clear();
                self.retry_pending = false;
                Ok(report)
            }
            Err(e) => {
                self.retry_pending = true;
                Err(e)
            }
        }
    }

    /// Flush if a trigger is due. Returns `None` when nothing was due.
    pub fn tick<S: PersistenceSink + ?Sized>(
        &mut self,
        now: Now,
        sink: &mut S,
    ) -> Option<PersistResult<CommitReport>> {
        self.flush_due(now.instant).then(|| self.flush(now, sink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{PersistError, sqlite::SqliteSink};

    const T0: f64 = 1_717_286_400.0;

    fn record(snr: i32, timestamp: f64) -> EnrichedRecord {
        EnrichedRecord {
            zone: 4,
            band: 20,
            snr,
            timestamp,
            spotter: "VE3EID".to_string(),
        }
    }

    fn at(start: Instant, secs: f64) -> Now {
        Now {
            instant: start + Duration::from_secs_f64(secs),
            unix: T0 + secs,
        }
    }

    /// Sink that records batch sizes and can be switched to fail.
    #[derive(Default)]
    struct RecordingSink {
        batches: Vec<usize>,
        fail: bool,
    }

    impl PersistenceSink for RecordingSink {
        fn commit(
            &mut self,
            batch: &[EnrichedRecord],
            _evict_before: f64,
        ) -> PersistResult<CommitReport> {
            if self.fail {
                return Err(PersistError::Message("disk unavailable".to_string()));
            }
            self.batches.push(batch.len());
            Ok(CommitReport {
                inserted: batch.len(),
                evicted: 0,
            })
        }
    }

    #[test]
    fn test_count_trigger_fires_at_threshold() {
        let start = Instant::now();
        let mut store = WindowStore::new(StoreConfig::default(), start);
        let mut sink = RecordingSink::default();

        // 500 records within 10 seconds.
        for i in 0..499 {
            let secs = i as f64 * 10.0 / 500.0;
            assert!(!store.admit(record(-5, T0 + secs)));
            assert!(!store.flush_due(at(start, secs).instant));
        }
        assert!(store.admit(record(-5, T0 + 9.98)));

        let report = store.flush(at(start, 9.98), &mut sink).unwrap();
        assert_eq!(report.inserted, 500);
        assert_eq!(sink.batches, vec![500]);
        assert!(store.is_empty());
    }

    #[test]
    fn test_time_trigger_fires_for_slow_trickle() {
        let start = Instant::now();
        let mut store = WindowStore::new(StoreConfig::default(), start);
        let mut sink = RecordingSink::default();

        // 10 records over 35 seconds, housekeeping every second.
        let mut first_flush = None;
        let mut next_record = 0.0;
        let mut admitted = 0;
        for second in 0..=35 {
            let now = at(start, second as f64);
            while admitted < 10 && next_record <= second as f64 {
                assert!(!store.admit(record(-5, now.unix)));
                admitted += 1;
                next_record += 3.5;
            }
            if let Some(result) = store.tick(now, &mut sink) {
                result.unwrap();
                first_flush.get_or_insert(second);
            }
        }

        assert_eq!(first_flush, Some(30));
        assert_eq!(sink.batches[0], 9);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_time_trigger_with_empty_buffer() {
        let start = Instant::now();
        let mut store = WindowStore::new(StoreConfig::default(), start);
        let mut sink = RecordingSink::default();

        assert!(store.tick(at(start, 29.0), &mut sink).is_none());
        let report = store.tick(at(start, 30.0), &mut sink).unwrap().unwrap();
        assert_eq!(report.inserted, 0);
        assert_eq!(sink.batches, vec![0]);
    }

    #[test]
    fn test_failed_flush_retains_records() {
        let start = Instant::now();
        let config = StoreConfig {
            flush_count: 3,
            ..Default::default()
        };
        let mut store = WindowStore::new(config, start);
        let mut sink = RecordingSink {
            fail: true,
            ..Default::default()
        };

        store.admit(record(1, T0));
        store.admit(record(2, T0));
        assert!(store.admit(record(3, T0)));
        assert!(store.flush(at(start, 1.0), &mut sink).is_err());
        assert_eq!(store.len(), 3);

        // Count trigger is held back until the timer paces the retry.
        assert!(!store.admit(record(4, T0 + 2.0)));
        assert!(!store.flush_due(at(start, 2.0).instant));
        assert!(store.flush_due(at(start, 31.0).instant));

        sink.fail = false;
        let report = store.tick(at(start, 31.0), &mut sink).unwrap().unwrap();
        assert_eq!(report.inserted, 4);
        assert!(store.is_empty());

        assert_eq!(sink.batches, vec![4]);
    }

    #[test]
    fn test_backpressure_discards_oldest() {
        let start = Instant::now();
        let config = StoreConfig {
            flush_count: 10,
            max_buffered: 3,
            ..Default::default()
        };
        let mut store = WindowStore::new(config, start);

        for snr in 1..=5 {
            store.admit(record(snr, T0));
        }
        assert_eq!(store.len(), 3);
        assert_eq!(store.dropped(), 2);
        let snrs: Vec<i32> = store.buffered().map(|r| r.snr).collect();
        assert_eq!(snrs, vec![3, 4, 5]);
    }

    #[test]
    fn test_flush_enforces_retention_window() {
        let start = Instant::now();
        let mut store = WindowStore::new(StoreConfig::default(), start);
        let mut sink = SqliteSink::open_in_memory().unwrap();

        store.admit(record(-20, T0 - 20.0 * 60.0));
        store.admit(record(-15, T0 - 15.0 * 60.0));
        store.admit(record(-10, T0 - 10.0 * 60.0));
        store.admit(record(-1, T0));
        let report = store.flush(at(start, 0.0), &mut sink).unwrap();
        assert_eq!(report.evicted, 2);

        let cutoff = store.evict_before(T0);
        assert_eq!(cutoff, T0 - 900.0);
        let rows = sink.scan().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.timestamp > cutoff));

        // Time passes with no new spots; the next time-triggered flush still evicts.
        let later = at(start, 6.0 * 60.0);
        let report = store.tick(later, &mut sink).unwrap().unwrap();
        assert_eq!(report.evicted, 1);
        assert!(
            sink.scan()
                .unwrap()
                .iter()
                .all(|r| r.timestamp > store.evict_before(later.unix))
        );
    }
}
