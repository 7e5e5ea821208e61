//! The ingestion loop.
//!
//! One task owns every stage: it polls the [`FeedConnector`], splits bytes
//! into lines, parses and enriches spots, admits records to the
//! [`WindowStore`] and runs the flush triggers between polls. No stage
//! blocks for longer than the connector's poll timeout, so shutdown and
//! housekeeping are never starved by a quiet feed or a reconnect delay.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{Level, debug, error, info, warn};

use crate::assembler::LineAssembler;
use crate::band;
use crate::client::{ClientError, FeedConfig, FeedConnector, PollOutcome};
use crate::parser::SpotParser;
use crate::persist::{CommitReport, PersistResult, PersistenceSink};
use crate::spot::{EnrichedRecord, ParsedSpot, unix_seconds};
use crate::stats::PipelineStats;
use crate::store::{Now, StoreConfig, WindowStore};
use crate::zones::ZoneTable;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("feed failed: {0}")]
    Feed(#[from] ClientError),
}

/// Result of enriching one parsed spot.
#[derive(Debug, Clone, PartialEq)]
pub enum Enrichment {
    Record(EnrichedRecord),
    /// No prefix of the callsign is in the zone table.
    UnknownZone,
    /// The frequency falls outside every band.
    Unclassifiable,
}

/// Attach zone and band to a spot.
pub fn enrich(spot: &ParsedSpot, spotter: &str, zones: &ZoneTable) -> Enrichment {
    let Some(zone) = zones.resolve(&spot.callsign) else {
        return Enrichment::UnknownZone;
    };
    let Some(band) = band::classify(spot.frequency_khz) else {
        return Enrichment::Unclassifiable;
    };

    Enrichment::Record(EnrichedRecord {
        zone: zone.cq_zone,
        band,
        snr: spot.snr_db,
        timestamp: unix_seconds(spot.received_at),
        spotter: spotter.to_string(),
    })
}

/// What happened to a single line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    /// Not from the target spotter, or not an accepted mode.
    Ignored,
    ParseFailed,
    UnknownZone,
    Unclassifiable,
    Admitted,
}

pub struct Pipeline<S: PersistenceSink> {
    connector: FeedConnector,
    assembler: LineAssembler,
    parser: SpotParser,
    zones: Arc<ZoneTable>,
    store: WindowStore,
    sink: S,
    stats: Arc<PipelineStats>,
    housekeeping_interval: Duration,
}

impl<S: PersistenceSink> Pipeline<S> {
    pub fn new(
        feed: FeedConfig,
        parser: SpotParser,
        zones: Arc<ZoneTable>,
        store: StoreConfig,
        sink: S,
    ) -> Self {
        Self {
            connector: FeedConnector::new(feed),
            assembler: LineAssembler::new(),
            parser,
            zones,
            store: WindowStore::new(store, Instant::now()),
            sink,
            stats: Arc::new(PipelineStats::new()),
            housekeeping_interval: Duration::from_secs(1),
        }
    }

    /// Share an existing statistics handle, e.g. with the metrics server.
    pub fn with_stats(mut self, stats: Arc<PipelineStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_max_line_len(mut self, max_line_len: usize) -> Self {
        self.assembler = LineAssembler::with_max_line_len(max_line_len);
        self
    }

    pub fn with_housekeeping_interval(mut self, interval: Duration) -> Self {
        self.housekeeping_interval = interval;
        self
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    pub fn store(&self) -> &WindowStore {
        &self.store
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn connector(&self) -> &FeedConnector {
        &self.connector
    }

    /// Run until `shutdown` turns true or the connector gives up.
    ///
    /// Buffered records are flushed before returning in both cases.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), PipelineError> {
        info!(
            "Collecting {} spots from {} via {}",
            self.parser
                .modes()
                .iter()
                .map(|m| m.as_str())
                .collect::<Vec<_>>()
                .join("/"),
            self.parser.spotter(),
            self.connector.config().addr()
        );

        if let Err(e) = self.connector.connect().await {
            if e.is_fatal() {
                self.finish();
                return Err(e.into());
            }
            warn!("Initial connection failed: {}", e);
        }

        let mut next_housekeeping = Instant::now() + self.housekeeping_interval;
        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            let outcome = tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                    continue;
                }

                outcome = self.connector.poll() => outcome,
            };

            match outcome {
                Ok(PollOutcome::Data(bytes)) => {
                    self.stats.record_bytes(bytes.len() as u64);
                    for line in self.assembler.feed(&bytes) {
                        self.process_line(&line, Utc::now());
                    }
                }
                Ok(PollOutcome::Reconnected) => {
                    self.assembler.reset();
                    self.stats.record_reconnect();
                    info!("Feed session re-established");
                }
                Ok(PollOutcome::Timeout) => {}
                Ok(PollOutcome::Backoff { remaining }) => {
                    debug!("Reconnecting in {:?}", remaining);
                }
                Err(e) => {
                    error!("Giving up on the feed: {}", e);
                    break Err(e.into());
                }
            }

            let now = Instant::now();
            if now >= next_housekeeping {
                self.housekeeping(Now::current());
                next_housekeeping = now + self.housekeeping_interval;
            }
        };

        self.finish();
        result
    }

    /// Parse, enrich and admit one complete line.
    pub fn process_line(&mut self, line: &str, received_at: DateTime<Utc>) -> LineOutcome {
        self.stats.record_line();

        let spot = match self.parser.parse_line(line, received_at) {
            Ok(Some(spot)) => spot,
            Ok(None) => {
                self.stats.record_non_matching();
                return LineOutcome::Ignored;
            }
            Err(e) => {
                self.stats.record_parse_failure();
                warn!("Unparseable spot ({}): {}", e, line);
                return LineOutcome::ParseFailed;
            }
        };

        let record = match enrich(&spot, self.parser.spotter(), &self.zones) {
            Enrichment::Record(record) => record,
            Enrichment::UnknownZone => {
                self.stats.record_unknown_zone();
                debug!("No zone for {}", spot.callsign);
                return LineOutcome::UnknownZone;
            }
            Enrichment::Unclassifiable => {
                self.stats.record_unclassifiable();
                debug!("{} kHz is outside every band", spot.frequency_khz);
                return LineOutcome::Unclassifiable;
            }
        };

        if tracing::enabled!(Level::DEBUG)
            && let Some(info) = self.zones.resolve(&spot.callsign)
        {
            debug!(
                "{} [{} {}, CQ {}]",
                spot, info.country, info.continent, info.cq_zone
            );
        }
        self.stats.record_admitted(&record);
        if self.store.admit(record) {
            let result = self.store.flush(Now::current(), &mut self.sink);
            self.record_flush(result);
        }
        self.stats.set_backpressure_drops(self.store.dropped());
        LineOutcome::Admitted
    }

    /// Fire the flush triggers if either is due.
    pub fn housekeeping(&mut self, now: Now) {
        if let Some(result) = self.store.tick(now, &mut self.sink) {
            self.record_flush(result);
        }
        self.stats.set_backpressure_drops(self.store.dropped());
    }

    fn record_flush(&self, result: PersistResult<CommitReport>) {
        match result {
            Ok(report) => self.stats.record_flush(&report),
            Err(e) => {
                self.stats.record_flush_failure();
                error!(
                    "Flush failed, keeping {} records for retry: {}",
                    self.store.len(),
                    e
                );
            }
        }
    }

    fn finish(&mut self) {
        if !self.store.is_empty() {
            info!("Flushing {} buffered records", self.store.len());
            let result = self.store.flush(Now::current(), &mut self.sink);
            self.record_flush(result);
        }
        self.connector.disconnect();
    }
}
