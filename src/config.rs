//! Configuration file support.
//!
//! Loads settings from `~/.config/dxcluster-ingest/config.toml` on Linux
//! (or platform-appropriate location on other OSes). Every field has a
//! default, so a file only needs the settings that differ. Durations are
//! whole seconds.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::assembler::DEFAULT_MAX_LINE_LEN;
use crate::client::{DEFAULT_HOST, DEFAULT_PORT, FeedConfig};
use crate::parser::SpotParser;
use crate::spot::Mode;
use crate::store::StoreConfig;

/// Deserialize a human-readable size string like "4KB" into bytes.
fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_size(&s).map_err(serde::de::Error::custom)
}

/// Parse a human-readable size string into bytes.
///
/// Supports: B, KB, MB, GB (case-insensitive).
/// Examples: "100", "500KB", "10MB", "1GB"
pub fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let s_upper = s.to_ascii_uppercase();

    // Find where the numeric part ends
    let num_end = s_upper
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s_upper.len());

    let (num_str, unit) = s_upper.split_at(num_end);
    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("invalid number in size: {}", s))?;

    let multiplier: usize = match unit.trim() {
        "" | "B" => 1,
        "KB" | "K" => 1024,
        "MB" | "M" => 1024 * 1024,
        "GB" | "G" => 1024 * 1024 * 1024,
        _ => return Err(format!("unknown size unit: {}", unit)),
    };

    Ok((num * multiplier as f64) as usize)
}

/// Application configuration loaded from TOML file.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Login identifier sent to the cluster.
    pub login: String,

    /// Cluster hostname.
    pub host: String,

    /// Cluster port.
    pub port: u16,

    /// Commands sent after login to configure the cluster's output.
    pub login_commands: Vec<String>,

    /// Text the cluster sends once it is ready to stream spots.
    pub ready_marker: String,

    /// Spotter whose reports are collected (bare callsign, no `-#`).
    pub spotter: String,

    /// Modes whose spots are collected.
    pub modes: Vec<Mode>,

    /// Prefix-to-zone file: `cty.plist`, or JSON with the same keys.
    pub zone_file: PathBuf,

    /// SQLite database holding the windowed records.
    pub database: PathBuf,

    /// Connection and login timeout in seconds.
    pub connect_timeout: u64,

    /// Longest single wait for data, in seconds.
    pub poll_timeout: u64,

    /// Reconnect when the cluster sends nothing for this many seconds.
    pub read_timeout: u64,

    /// First reconnect delay in seconds; doubles per failed attempt.
    pub reconnect_base_delay: u64,

    /// Consecutive failed reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,

    /// Records older than this many seconds are evicted.
    pub retention: u64,

    /// Flush once this many records are buffered.
    pub flush_count: usize,

    /// Flush at least every this many seconds.
    pub flush_interval: u64,

    /// Hard cap on buffered, unpersisted records.
    pub max_buffered: usize,

    /// Seconds between flush-trigger checks.
    pub housekeeping_interval: u64,

    /// Longest accepted line (human-readable, e.g. "4KB").
    #[serde(deserialize_with = "deserialize_size")]
    pub max_line_len: usize,

    /// Print statistics every N seconds (0 disables).
    pub stats_interval: u64,

    /// Enable Prometheus metrics HTTP endpoint.
    pub metrics_enabled: bool,

    /// Port for Prometheus metrics HTTP endpoint.
    pub metrics_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        let feed = FeedConfig::default();
        let store = StoreConfig::default();
        Self {
            login: feed.login,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            login_commands: feed.login_commands,
            ready_marker: feed.ready_marker,
            spotter: "VE3EID".to_string(),
            modes: vec![Mode::Ft8, Mode::Ft4],
            zone_file: PathBuf::from("cty.plist"),
            database: PathBuf::from("callsigns.db"),
            connect_timeout: feed.connect_timeout.as_secs(),
            poll_timeout: feed.poll_timeout.as_secs(),
            read_timeout: feed.read_timeout.as_secs(),
            reconnect_base_delay: feed.reconnect_base_delay.as_secs(),
            max_reconnect_attempts: feed.max_reconnect_attempts,
            retention: store.retention.as_secs(),
            flush_count: store.flush_count,
            flush_interval: store.flush_interval.as_secs(),
            max_buffered: store.max_buffered,
            housekeeping_interval: 1,
            max_line_len: DEFAULT_MAX_LINE_LEN,
            stats_interval: 60,
            metrics_enabled: false,
            metrics_port: 9090,
        }
    }
}

impl Config {
    /// Load configuration from the default config file location.
    ///
    /// Returns default config if the file doesn't exist.
    /// Returns an error if the file exists but is malformed.
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Config::default()),
        }
    }

    /// Load configuration from an explicit path, which must exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Invalid TOML in config file: {}", path.display()))
    }

    /// Returns the path to the config file.
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("dxcluster-ingest/config.toml"))
    }

    /// Validate all configuration settings.
    pub fn validate(&self) -> Result<()> {
        if self.spotter.trim().is_empty() {
            bail!("spotter must not be empty");
        }
        if self.login.trim().is_empty() {
            bail!("login must not be empty");
        }
        if self.modes.is_empty() {
            bail!("at least one mode must be accepted");
        }
        if self.poll_timeout == 0 {
            bail!("poll_timeout must be at least 1 second");
        }
        if self.read_timeout < self.poll_timeout {
            bail!(
                "read_timeout ({}) must be at least poll_timeout ({})",
                self.read_timeout,
                self.poll_timeout
            );
        }
        if self.housekeeping_interval == 0 {
            bail!("housekeeping_interval must be at least 1 second");
        }
        if self.flush_count == 0 {
            bail!("flush_count must be positive");
        }
        if self.max_buffered < self.flush_count {
            bail!(
                "max_buffered ({}) must be at least flush_count ({})",
                self.max_buffered,
                self.flush_count
            );
        }
        if self.retention == 0 {
            bail!("retention must be positive");
        }
        if self.max_line_len == 0 {
            bail!("max_line_len must be positive");
        }
        Ok(())
    }

    /// Settings for the feed connection.
    pub fn feed_config(&self) -> FeedConfig {
        FeedConfig {
            host: self.host.clone(),
            port: self.port,
            login: self.login.clone(),
            login_commands: self.login_commands.clone(),
            ready_marker: self.ready_marker.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            poll_timeout: Duration::from_secs(self.poll_timeout),
            read_timeout: Duration::from_secs(self.read_timeout),
            reconnect_base_delay: Duration::from_secs(self.reconnect_base_delay),
            max_reconnect_attempts: self.max_reconnect_attempts,
        }
    }

    /// Settings for the window store.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            flush_count: self.flush_count,
            flush_interval: Duration::from_secs(self.flush_interval),
            retention: Duration::from_secs(self.retention),
            max_buffered: self.max_buffered,
        }
    }

    /// Parser for the configured spotter and modes.
    pub fn spot_parser(&self) -> SpotParser {
        SpotParser::new(&self.spotter, self.modes.iter().copied())
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_secs(self.housekeeping_interval)
    }
}
