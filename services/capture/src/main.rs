//! Capture agent entry point.
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, /etc/litterwatch/capture.toml)
//! 2. Environment variables (prefixed with CAPTURE__)

use anyhow::Context;
use litterwatch_capture::config::{CaptureConfig, LoggingConfig};
use litterwatch_capture::{source, CaptureAgent, CaptureStats, HttpUploader, IntervalTicker, ServerProbe};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = CaptureConfig::load().context("Failed to load configuration")?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = "litterwatch-capture",
        version = env!("CARGO_PKG_VERSION"),
        device_id = %config.device.device_id,
        "Starting capture agent"
    );

    // Validate configuration
    config.validate()?;

    // Network join is handled by the device firmware
    info!(
        ssid = %config.wifi.ssid,
        upload_url = %config.server.upload_url,
        "Network settings loaded"
    );

    let probe = ServerProbe::for_url(&config.server.upload_url, config.server.probe_timeout())?;
    let uploader = HttpUploader::new(
        config.server.upload_url.clone(),
        config.device.device_id.clone(),
        config.server.request_timeout(),
        Arc::new(probe),
    )?;
    let frame_source = source::from_config(&config.capture, config.server.request_timeout())?;
    let ticker = IntervalTicker::new(config.capture.interval(), config.capture.poll());

    let mut agent = CaptureAgent::new(frame_source, uploader, ticker);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received shutdown signal"),
                Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
            }
            cancel.cancel();
        }
    });

    let stats = agent.run(cancel).await;

    log_final_stats(&stats);
    info!("Shutdown complete");

    Ok(())
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("litterwatch_capture={}", level).parse()?)
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=info".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Log final statistics on shutdown.
fn log_final_stats(stats: &CaptureStats) {
    info!(
        cycles = stats.cycles,
        uploads_ok = stats.uploads_ok,
        uploads_failed = stats.uploads_failed,
        capture_failures = stats.capture_failures,
        offline_skips = stats.offline_skips,
        "Capture final stats"
    );
}
