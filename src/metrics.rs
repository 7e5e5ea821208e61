//! Prometheus metrics HTTP server.
//!
//! Exposes pipeline statistics in Prometheus text format via HTTP endpoint.

use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use tokio::net::TcpListener;
use tracing::info;

use crate::stats::PipelineStats;

/// Start the Prometheus metrics HTTP server.
///
/// Runs in the background and serves metrics at `/metrics`.
/// Returns an error if the server fails to bind to the port.
pub async fn start_metrics_server(
    port: u16,
    stats: Arc<PipelineStats>,
) -> Result<(), std::io::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(stats);

    let listener = TcpListener::bind(addr).await?;
    info!("Prometheus metrics server listening on http://{}/metrics", addr);

    axum::serve(listener, app)
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Prometheus metrics endpoint.
async fn metrics_handler(State(stats): State<Arc<PipelineStats>>) -> impl IntoResponse {
    let output = format_prometheus_metrics(&stats);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        output,
    )
}

fn push_metric(
    output: &mut String,
    name: &str,
    kind: &str,
    help: &str,
    value: impl std::fmt::Display,
) {
    let _ = writeln!(output, "# HELP {} {}", name, help);
    let _ = writeln!(output, "# TYPE {} {}", name, kind);
    let _ = writeln!(output, "{} {}", name, value);
}

/// Format statistics as Prometheus text format.
fn format_prometheus_metrics(stats: &PipelineStats) -> String {
    let summary = stats.summary();
    let mut output = String::with_capacity(4096);

    push_metric(
        &mut output,
        "dxc_uptime_seconds",
        "gauge",
        "Time since ingestion started",
        format_args!("{:.3}", summary.elapsed_secs),
    );

    let counters = [
        (
            "dxc_lines_total",
            "Complete lines received from the cluster",
            summary.lines_received,
        ),
        (
            "dxc_bytes_total",
            "Raw bytes received from the cluster",
            summary.bytes_received,
        ),
        (
            "dxc_non_matching_lines_total",
            "Lines not from the target spotter or mode",
            summary.non_matching_lines,
        ),
        (
            "dxc_parse_failures_total",
            "Eligible lines that failed to parse",
            summary.parse_failures,
        ),
        (
            "dxc_unknown_zone_total",
            "Spots dropped for an unknown callsign prefix",
            summary.unknown_zone,
        ),
        (
            "dxc_unclassifiable_total",
            "Spots dropped for an out-of-band frequency",
            summary.unclassifiable,
        ),
        (
            "dxc_admitted_total",
            "Records admitted to the window store",
            summary.admitted,
        ),
        (
            "dxc_persisted_total",
            "Records written to the durable table",
            summary.persisted,
        ),
        (
            "dxc_evicted_total",
            "Rows evicted past the retention window",
            summary.evicted,
        ),
        (
            "dxc_backpressure_drops_total",
            "Buffered records discarded because the buffer was full",
            summary.backpressure_drops,
        ),
        (
            "dxc_flushes_total",
            "Successful flushes",
            summary.flushes,
        ),
        (
            "dxc_flush_failures_total",
            "Failed flushes",
            summary.flush_failures,
        ),
        (
            "dxc_reconnects_total",
            "Cluster sessions re-established",
            summary.reconnects,
        ),
    ];
    for (name, help, value) in counters {
        push_metric(&mut output, name, "counter", help, value);
    }

    output.push_str("# HELP dxc_records_by_band_total Admitted records by band\n");
    output.push_str("# TYPE dxc_records_by_band_total counter\n");
    let mut bands: Vec<_> = summary.records_by_band.iter().collect();
    bands.sort();
    for (band, count) in bands {
        let _ = writeln!(
            output,
            "dxc_records_by_band_total{{band=\"{}m\"}} {}",
            band, count
        );
    }

    output.push_str("# HELP dxc_records_by_zone_total Admitted records by CQ zone\n");
    output.push_str("# TYPE dxc_records_by_zone_total counter\n");
    let mut zones: Vec<_> = summary.records_by_zone.iter().collect();
    zones.sort();
    for (zone, count) in zones {
        let _ = writeln!(
            output,
            "dxc_records_by_zone_total{{zone=\"{}\"}} {}",
            zone, count
        );
    }

    if let Some(ref snr) = summary.snr_percentiles {
        output.push_str("# HELP dxc_snr_db SNR distribution in decibels\n");
        output.push_str("# TYPE dxc_snr_db summary\n");
        let _ = writeln!(output, "dxc_snr_db{{quantile=\"0.5\"}} {}", snr.p50);
        let _ = writeln!(output, "dxc_snr_db{{quantile=\"0.9\"}} {}", snr.p90);
        let _ = writeln!(output, "dxc_snr_db_count {}", summary.admitted);
    }

    output
}
