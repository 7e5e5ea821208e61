//! Data structures representing cluster spots.
//!
//! A [`ParsedSpot`] is what the parser extracts from one eligible cluster line.
//! Once it has been given a CQ zone and a band it becomes an [`EnrichedRecord`],
//! the unit that is buffered and persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The transmission mode of the spot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    /// Continuous Wave (Morse code)
    Cw,
    /// Radio Teletype
    Rtty,
    /// FT8 digital mode
    Ft8,
    /// FT4 digital mode
    Ft4,
    /// PSK31 digital mode
    Psk31,
}

impl Mode {
    /// All modes the parser knows how to recognise.
    pub const ALL: [Mode; 5] = [Mode::Cw, Mode::Rtty, Mode::Ft8, Mode::Ft4, Mode::Psk31];

    /// The marker used for this mode in cluster lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Cw => "CW",
            Mode::Rtty => "RTTY",
            Mode::Ft8 => "FT8",
            Mode::Ft4 => "FT4",
            Mode::Psk31 => "PSK31",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mode::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown mode: {}", s))
    }
}

/// A spot announced by the target spotter, as extracted from one line.
///
/// # Example
///
/// A raw line like:
/// ```text
/// DX de VE3EID-#:  14074.00  VE3XYZ  FT8  -05 dB  2345Z
/// ```
///
/// Would be parsed into a `ParsedSpot` with:
/// - `frequency_khz`: 14074.00
/// - `callsign`: "VE3XYZ"
/// - `snr_db`: -5
/// - `mode`: Mode::Ft8
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedSpot {
    /// The frequency in kHz where the signal was heard.
    pub frequency_khz: f64,

    /// The spotted station, upper-cased.
    pub callsign: String,

    /// Signal-to-noise ratio in decibels, as reported by the spotter.
    pub snr_db: i32,

    /// The transmission mode named on the line.
    pub mode: Mode,

    /// Local time the line was received.
    pub received_at: DateTime<Utc>,
}

impl fmt::Display for ParsedSpot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>9.2} {} {} {} dB {}",
            self.frequency_khz,
            self.callsign,
            self.mode,
            self.snr_db,
            self.received_at.format("%H:%M:%SZ")
        )
    }
}

/// A spot with its zone and band resolved. This is the persisted row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    /// CQ zone of the spotted station (1-40).
    pub zone: u8,

    /// Band in meters (160, 80, ... 6).
    pub band: u16,

    /// Signal-to-noise ratio in decibels.
    pub snr: i32,

    /// Arrival time as fractional unix seconds.
    pub timestamp: f64,

    /// The spotter that reported this signal (without the `-#` suffix).
    pub spotter: String,
}

/// Convert a UTC instant to fractional unix seconds.
pub fn unix_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}
