//! DX cluster ingest CLI - collect one skimmer's spots into a rolling SQLite window.

use anyhow::{Context, Result};
use clap::Parser;
use dxcluster_ingest::{
    Config, Mode, Pipeline, PipelineStats, SqliteSink, ZoneTable, band, metrics,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// DX cluster ingest - keep a rolling window of one spotter's FT8/FT4 reports
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (defaults to the per-user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Login identifier for the cluster
    #[arg(short, long, env = "DXC_LOGIN")]
    login: Option<String>,

    /// Cluster hostname
    #[arg(long, env = "DXC_HOST")]
    host: Option<String>,

    /// Cluster port
    #[arg(long, env = "DXC_PORT")]
    port: Option<u16>,

    /// Spotter whose reports are collected
    #[arg(long, env = "DXC_SPOTTER")]
    spotter: Option<String>,

    /// Accepted modes (repeatable, e.g. --mode FT8 --mode FT4)
    #[arg(long = "mode")]
    modes: Vec<Mode>,

    /// Prefix-to-zone file (cty.plist or JSON)
    #[arg(long)]
    zone_file: Option<PathBuf>,

    /// SQLite database path
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Retention window in seconds
    #[arg(long)]
    retention: Option<u64>,

    /// Print statistics every N seconds (0 disables)
    #[arg(short, long)]
    stats_interval: Option<u64>,

    /// Enable Prometheus metrics endpoint
    #[arg(long)]
    metrics: bool,

    /// Port for Prometheus metrics endpoint
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Print the per-zone, per-band summary of the database as JSON and exit
    #[arg(long)]
    report: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Maximum runtime in seconds (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    max_runtime: u64,
}

impl Args {
    /// Apply command-line overrides on top of the file config.
    fn apply(&self, config: &mut Config) {
        if let Some(login) = &self.login {
            config.login = login.clone();
        }
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(spotter) = &self.spotter {
            config.spotter = spotter.clone();
        }
        if !self.modes.is_empty() {
            config.modes = self.modes.clone();
        }
        if let Some(zone_file) = &self.zone_file {
            config.zone_file = zone_file.clone();
        }
        if let Some(database) = &self.database {
            config.database = database.clone();
        }
        if let Some(retention) = self.retention {
            config.retention = retention;
        }
        if let Some(interval) = self.stats_interval {
            config.stats_interval = interval;
        }
        if self.metrics {
            config.metrics_enabled = true;
        }
        if let Some(port) = self.metrics_port {
            config.metrics_port = port;
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    if args.report {
        return print_report(&config);
    }

    info!("DX cluster ingest starting...");
    info!("Login: {}", config.login);
    info!("Server: {}:{}", config.host, config.port);

    let zones = ZoneTable::load(&config.zone_file)
        .with_context(|| format!("Failed to load zone table {}", config.zone_file.display()))?;

    let sink = SqliteSink::open(&config.database)
        .with_context(|| format!("Failed to open database {}", config.database.display()))?;
    info!("Writing records to {}", config.database.display());

    // Create shared statistics
    let stats = Arc::new(PipelineStats::new());

    if config.metrics_enabled {
        let port = config.metrics_port;
        let stats_clone = Arc::clone(&stats);
        tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(port, stats_clone).await {
                warn!("Metrics server stopped: {}", e);
            }
        });
    }

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Handle Ctrl+C
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(forward_ctrl_c(signal::ctrl_c(), shutdown_tx_clone));

    // Optional max runtime
    if args.max_runtime > 0 {
        let shutdown_tx_clone = shutdown_tx.clone();
        let max_runtime = args.max_runtime;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(max_runtime)).await;
            info!("Max runtime reached");
            let _ = shutdown_tx_clone.send(true);
        });
    }

    // Start stats printer
    if config.stats_interval > 0 {
        let stats_clone = Arc::clone(&stats);
        let stats_interval = config.stats_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(stats_interval));
            interval.tick().await;
            loop {
                interval.tick().await;
                println!("\n{}", stats_clone.summary());
            }
        });
    }

    let mut pipeline = Pipeline::new(
        config.feed_config(),
        config.spot_parser(),
        Arc::new(zones),
        config.store_config(),
        sink,
    )
    .with_stats(Arc::clone(&stats))
    .with_max_line_len(config.max_line_len)
    .with_housekeeping_interval(config.housekeeping_interval());

    let result = pipeline.run(shutdown_rx).await;

    // Print final statistics
    println!("\n\nFINAL STATISTICS");
    println!("{}", stats.summary());

    if let Err(e) = result {
        error!("Ingestion stopped: {}", e);
        return Err(e.into());
    }
    Ok(())
}

/// Request shutdown once the interrupt arrives. If the handler cannot be
/// installed the pipeline keeps running; stop it with `--max-runtime` or a kill.
async fn forward_ctrl_c(
    signal: impl Future<Output = std::io::Result<()>>,
    shutdown: watch::Sender<bool>,
) {
    match signal.await {
        Ok(()) => {
            info!("Shutdown signal received");
            let _ = shutdown.send(true);
        }
        Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
    }
}

/// Print the aggregate view of the current window.
fn print_report(config: &Config) -> Result<()> {
    let sink = SqliteSink::open(&config.database)
        .with_context(|| format!("Failed to open database {}", config.database.display()))?;
    let summary = sink.aggregate()?;

    let rows: Vec<_> = summary
        .iter()
        .map(|row| {
            serde_json::json!({
                "zone": row.zone,
                "band": band::label(row.band),
                "count": row.count,
                "mean_snr": row.mean_snr,
                "trend_db_per_min": row.trend,
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_override_config() {
        let args = Args::parse_from([
            "dxcluster-ingest",
            "--login",
            "LZ3NY",
            "--spotter",
            "K1TTT",
            "--mode",
            "FT8",
            "--retention",
            "600",
            "--metrics",
        ]);
        let mut config = Config::default();
        args.apply(&mut config);

        assert_eq!(config.login, "LZ3NY");
        assert_eq!(config.spotter, "K1TTT");
        assert_eq!(config.modes, vec![Mode::Ft8]);
        assert_eq!(config.retention, 600);
        assert!(config.metrics_enabled);
        // Untouched fields keep the file values
        assert_eq!(config.port, Config::default().port);
    }

    #[tokio::test]
    async fn test_ctrl_c_requests_shutdown() {
        let (tx, rx) = watch::channel(false);
        forward_ctrl_c(std::future::ready(Ok(())), tx).await;
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn test_failed_ctrl_c_handler_keeps_running() {
        let (tx, rx) = watch::channel(false);
        let failed = std::future::ready(Err(std::io::Error::other("no signal support")));
        forward_ctrl_c(failed, tx).await;
        assert!(!*rx.borrow());
    }

    #[test]
    fn test_no_args_keeps_config() {
        let args = Args::parse_from(["dxcluster-ingest"]);
        let mut config = Config::default();
        args.apply(&mut config);
        assert_eq!(config.modes, vec![Mode::Ft8, Mode::Ft4]);
        assert!(!config.metrics_enabled);
    }
}
