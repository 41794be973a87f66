mod config;

use anyhow::Context as _;
use clap::Parser as _;
use config::{BackendKind, Config};
use gpu_serve::{
    AppState,
    auth::key_set,
    backend::{EchoBackend, ModelBackend, ProcessBackend},
    build_metrics_layer_and_handle, build_metrics_router, build_router,
    capabilities::CapabilityOracle,
    hardware::{FixedProbe, take_reading},
    preload_models,
    queue::AdmissionQueue,
    residency::ModelResidency,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

/// How long startup waits for accelerator detection before assuming CPU.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let config = Config::parse().validate()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_filter())),
        )
        .init();

    info!(
        port = config.port,
        device = ?config.device,
        backend = ?config.backend,
        gpu_memory_gb = ?config.gpu_memory_gb,
        request_timeout_secs = config.request_timeout_secs,
        api_keys = config.api_keys.len(),
        "Starting gpu-serve"
    );

    // Read the hardware once; requests are answered from this reading.
    let reading = take_reading(config.probe(), PROBE_TIMEOUT).await;
    let oracle = CapabilityOracle::new(Arc::new(FixedProbe(reading)))
        .with_memory_override(config.gpu_memory_gb);
    let device = oracle.detect().device;

    let backend: Arc<dyn ModelBackend> = match config.backend {
        BackendKind::Process => Arc::new(
            ProcessBackend::builder()
                .command(config.worker_command.clone())
                .models_dir(config.models_dir())
                .device(device)
                .build(),
        ),
        BackendKind::Echo => {
            warn!("Using the echo backend: requests are answered without running any model");
            Arc::new(EchoBackend::new(device))
        }
    };

    let residency = ModelResidency::new(Arc::clone(&backend));
    preload_models(&oracle, &residency)
        .await
        .context("Failed to preload models")?;

    let reclaim = Arc::clone(&backend);
    let queue = AdmissionQueue::with_cleanup(move || reclaim.reclaim());
    queue.start()?;

    let state = AppState::builder()
        .oracle(oracle)
        .queue(queue.clone())
        .residency(residency.clone())
        .request_timeout(config.request_timeout())
        .api_keys(Arc::new(key_set(config.api_keys.iter().cloned())))
        .build();

    let mut router = build_router(state);

    if config.metrics {
        let (prometheus_layer, prometheus_handle) =
            build_metrics_layer_and_handle(config.metrics_prefix.clone());
        router = router.layer(prometheus_layer);

        let metrics_router = build_metrics_router(prometheus_handle);
        let bind_addr = format!("0.0.0.0:{}", config.metrics_port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("Failed to bind metrics listener on {bind_addr}"))?;
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, metrics_router).await {
                error!(error = %e, "Metrics server failed");
            }
        });
        info!("Metrics endpoint enabled on {}", bind_addr);
    } else {
        info!("Metrics endpoint disabled");
    }

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {bind_addr}"))?;
    info!("gpu-serve listening on {}", bind_addr);

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Finish the running task, cancel the rest, then release the accelerator.
    queue.stop().await;
    residency.unload_all().await;
    info!("gpu-serve shutdown complete");

    served.context("Server error")
}

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
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
