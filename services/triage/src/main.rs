use anyhow::{Context, Result};
use litterwatch_triage::api::{start_api_server, AppState};
use litterwatch_triage::{
    ArtifactStore, BoundedWorker, Config, DetectionPipeline, HttpTaskNotifier, ProcessWorker,
    TaskNotifier, TriagePolicy,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, &config.service.log_format);

    config.validate().context("Invalid configuration")?;

    info!(
        service = %config.service.name,
        "Starting Litterwatch Triage Service"
    );

    if config.service.metrics_enabled {
        init_metrics(config.service.metrics_port)?;
    }

    let store = Arc::new(
        ArtifactStore::open(&config.storage)
            .await
            .context("Failed to initialize artifact store")?,
    );

    let worker = BoundedWorker::new(
        Arc::new(ProcessWorker::new(&config.inference)),
        config.inference.max_concurrent,
    );
    let model = config.inference.resolve_model();

    info!(
        program = %config.inference.program,
        model = %model,
        timeout = ?config.worker_timeout(),
        max_concurrent = config.inference.max_concurrent,
        "Inference worker configured"
    );

    let notifier: Option<Arc<dyn TaskNotifier>> = if config.notifier.enabled {
        Some(Arc::new(
            HttpTaskNotifier::new(&config.notifier).context("Failed to initialize task notifier")?,
        ))
    } else {
        info!("Task notifications disabled");
        None
    };

    let pipeline = DetectionPipeline::new(
        store,
        Arc::new(worker),
        TriagePolicy::new(&config.triage),
        notifier,
        model,
    );

    let state = AppState {
        pipeline: Arc::new(pipeline),
        max_upload_bytes: config.api.max_upload_bytes,
        service_name: config.service.name.clone(),
        notifications_enabled: config.notifier.enabled,
    };

    info!(threshold = config.triage.threshold, "Triage service started successfully");

    // Serve until a shutdown signal; in-flight uploads finish first
    if let Err(e) = start_api_server(state, &config.api, shutdown_signal()).await {
        error!(error = %e, "API server error");
        return Err(e);
    }

    info!("Triage service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().pretty()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }

    info!("Shutting down triage service");
}
