//! DX cluster ingestion - collect one skimmer's FT8/FT4 spots into a
//! rolling SQLite window.
//!
//! This crate provides:
//! - A resilient telnet connector with capped exponential backoff
//! - A nom-based spot parser and chunk-safe line assembly
//! - Zone and band enrichment via a prefix trie
//! - A time-windowed store that batches writes and evicts old rows
//!
//! # Example
//!
//! ```rust
//! use chrono::Utc;
//! use dxcluster_ingest::{Enrichment, SpotParser, ZoneInfo, ZoneTable, enrich, spot::Mode};
//!
//! let zones = ZoneTable::from_entries([(
//!     "VE3",
//!     ZoneInfo { continent: "NA".into(), country: "Canada".into(), cq_zone: 4 },
//! )])
//! .unwrap();
//! let parser = SpotParser::new("VE3EID", [Mode::Ft8]);
//!
//! let line = "DX de VE3EID-#:  14074.00  VE3XYZ  FT8  -05 dB  2345Z";
//! let spot = parser.parse_line(line, Utc::now()).unwrap().unwrap();
//!
//! match enrich(&spot, parser.spotter(), &zones) {
//!     Enrichment::Record(record) => assert_eq!((record.zone, record.band), (4, 20)),
//!     other => panic!("unexpected {:?}", other),
//! }
//! ```

pub mod assembler;
pub mod band;
pub mod client;
pub mod config;
pub mod metrics;
pub mod parser;
pub mod persist;
pub mod pipeline;
pub mod spot;
pub mod stats;
pub mod store;
pub mod zones;

pub use assembler::LineAssembler;
pub use client::{ClientError, ConnectionState, FeedConfig, FeedConnector, PollOutcome};
pub use config::Config;
pub use parser::{ParseError, SpotParser};
pub use persist::{PersistError, PersistenceSink, sqlite::SqliteSink};
pub use pipeline::{Enrichment, Pipeline, PipelineError, enrich};
pub use spot::{EnrichedRecord, Mode, ParsedSpot};
pub use stats::{PipelineStats, StatsSummary};
pub use store::{StoreConfig, WindowStore};
pub use zones::{ZoneInfo, ZoneTable};
