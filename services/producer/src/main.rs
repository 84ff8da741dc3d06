use anyhow::{Context, Result};
use camera_producer::config::{Config, RunMode, ServiceConfig};
use camera_producer::{
    CameraSource, CapturePipeline, HttpCamera, KafkaBroker, MessageBroker, ObjectStore,
    PartitionRing, S3ObjectStore, Scheduler, StartupError, TopicDescriptor,
};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // Logging is not up yet, so configuration problems go straight to stderr
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("camera-producer: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config.service);

    match run(config).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Camera producer failed to start");
            ExitCode::FAILURE
        }
    }
}

/// Load and validate configuration; the first argument overrides the run mode
fn load_config() -> Result<Config> {
    let mut config = Config::load().context("Failed to load configuration")?;

    if let Some(mode) = std::env::args().nth(1) {
        config.scheduler.mode = mode.parse().context("Invalid run mode argument")?;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn run(config: Config) -> Result<ExitCode> {
    info!(
        service = %config.service.name,
        mode = ?config.scheduler.mode,
        bucket = %config.s3.bucket,
        "Starting camera producer"
    );

    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    let ring = PartitionRing::from_config(&config.ring).context("Invalid ring configuration")?;

    let store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::new(&config.s3).await);
    let camera = HttpCamera::new(&config.camera).context("Failed to initialize camera client")?;
    info!(url = %camera.url(), "Camera client ready");
    let camera: Arc<dyn CameraSource> = Arc::new(camera);

    let broker = KafkaBroker::connect_with_retry(&config.kafka)
        .await
        .map_err(StartupError::from)
        .context("Failed to connect to Kafka")?;

    let topic = TopicDescriptor::raw_jpeg(&config.kafka.exchange, &config.kafka.location);
    broker
        .declare_topic(&topic)
        .await
        .map_err(StartupError::from)
        .context("Failed to declare notification topic")?;

    let pipeline = CapturePipeline::new(ring.clone(), camera, store.clone(), Arc::new(broker), topic);

    let mut scheduler = Scheduler::start(ring, store, pipeline)
        .await
        .context("Failed to start partition ring")?;

    match config.scheduler.mode {
        RunMode::Once => match scheduler.run_once().await {
            Ok(record) => {
                info!(key = %record.destination_key, "Single-shot capture complete");
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => {
                error!(stage = %e.stage(), error = %e, "Single-shot capture failed");
                Ok(ExitCode::FAILURE)
            }
        },
        RunMode::Interval => {
            let shutdown = CancellationToken::new();
            let trigger = shutdown.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                info!("Finishing current tick before exit");
                trigger.cancel();
            });

            info!(interval_ms = config.scheduler.poll_interval_ms, "Camera producer started");
            scheduler.run(config.poll_interval(), shutdown).await;
            info!("Camera producer stopped");

            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Initialize tracing/logging
fn init_tracing(service: &ServiceConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&service.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if service.log_format.eq_ignore_ascii_case("pretty") {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
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
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
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
}
