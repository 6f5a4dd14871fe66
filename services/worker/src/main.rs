use anyhow::{Context, Result};
use fieldcam_worker::{
    AuditSink, CommandPoller, Config, DeviceRegistry, MqttPublisher, PgRecordStore, Reaper,
    Router, S3BlobStore, WorkerCtx,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How long in-flight device workers get to drain on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(Config::load().context("Failed to load configuration")?);

    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        broker = %config.mqtt.host,
        bucket = %config.storage.bucket,
        "starting fieldcam ingestion worker"
    );

    if config.service.metrics_port != 0 {
        init_metrics(config.service.metrics_port)?;
    }

    // Sinks first: record store, blob store.
    let store = Arc::new(
        PgRecordStore::connect(&config.database)
            .await
            .context("Failed to connect to record store")?,
    );
    let blob = Arc::new(S3BlobStore::new(&config.storage).await);

    // Transport and the audited publish side.
    let (client, eventloop) = fieldcam_worker::mqtt::connect(&config.mqtt, &config.service.name);
    let audit = AuditSink::spawn(store.clone(), config.database.audit_queue_depth);
    let publisher = Arc::new(MqttPublisher::new(client.clone(), audit.clone()));

    // Per-device workers and the inbound router.
    let cancel = CancellationToken::new();
    let ctx = WorkerCtx::new(config.clone(), store.clone(), blob, publisher.clone());
    let registry = DeviceRegistry::new(ctx, cancel.clone());
    let router = Router::new(config.topics.clone(), registry.clone(), audit, store.clone());

    // Background tasks.
    let reaper = Reaper::new(registry.clone(), config.reaper_interval());
    let reaper_handle = tokio::spawn(reaper.run(cancel.clone()));

    let poller = CommandPoller::new(
        store,
        publisher,
        config.topics.clone(),
        config.command_poll_interval(),
        config.commands.batch_limit,
    );
    let poller_handle = tokio::spawn(poller.run(cancel.clone()));

    let transport_handle = tokio::spawn(fieldcam_worker::mqtt::run_event_loop(
        eventloop,
        client,
        config.topics.clone(),
        router,
        cancel.clone(),
    ));

    info!("worker started, processing messages");

    shutdown_signal().await;
    info!("shutting down");

    // Stop accepting transport callbacks, then let workers drain.
    cancel.cancel();
    if let Err(e) = transport_handle.await {
        error!(error = %e, "transport task join failed");
    }
    registry.join_all(SHUTDOWN_GRACE).await;
    let _ = reaper_handle.await;
    let _ = poller_handle.await;

    info!("shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "prometheus metrics exporter started");
    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C");
        }
        _ = terminate => {
            info!("received SIGTERM");
        }
    }
}
