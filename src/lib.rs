//! gpu-serve - image upscaling, generation and captioning on a single shared accelerator
//!
//! Three pieces keep concurrent HTTP requests from fighting over accelerator memory:
//!
//! - [`capabilities::CapabilityOracle`] maps the detected hardware to the operations it can
//!   run, and rejects everything else before any work is queued
//! - [`queue::AdmissionQueue`] runs GPU tasks one at a time, in submission order
//! - [`residency::ModelResidency`] decides which models hold accelerator memory, swapping the
//!   large generation models on demand and keeping the small ones loaded
//!
//! Models themselves are hosted by a [`backend::ModelBackend`].
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use bon::Builder;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

pub mod auth;
pub mod backend;
pub mod capabilities;
pub mod catalog;
pub mod errors;
pub mod handlers;
pub mod hardware;
pub mod models;
pub mod queue;
pub mod residency;

use auth::KeySet;
use capabilities::{Capability, CapabilityOracle, CapabilitySet};
use queue::AdmissionQueue;
use residency::{LoadError, ModelResidency};

/// Largest accepted request body. Uploaded images can be big.
pub const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Shared state handed to every handler
#[derive(Clone, Debug, Builder)]
pub struct AppState {
    pub oracle: CapabilityOracle,
    pub queue: AdmissionQueue,
    pub residency: ModelResidency,
    /// How long a handler waits for its queued task.
    #[builder(default = Duration::from_secs(600))]
    pub request_timeout: Duration,
    /// Accepted bearer keys. Empty disables authentication.
    #[builder(default)]
    pub api_keys: Arc<KeySet>,
}

/// Detect capabilities and load every model that is kept resident for the process lifetime.
///
/// Generation models are not loaded here; they are swapped in by the first request that needs
/// them.
pub async fn preload_models(
    oracle: &CapabilityOracle,
    residency: &ModelResidency,
) -> Result<CapabilitySet, LoadError> {
    let caps = oracle.detect();
    info!(
        device = %caps.device,
        memory_gb = caps.gpu_memory_gb,
        capabilities = ?caps.capabilities.iter().map(ToString::to_string).collect::<Vec<_>>(),
        "Detected capabilities"
    );
    if caps.is_slow() {
        warn!("No CUDA device detected, running on CPU (slow)");
    }

    let generation: Vec<&str> = caps
        .capabilities
        .iter()
        .filter_map(|c| match c {
            Capability::Image { model } => Some(model.as_str()),
            _ => None,
        })
        .collect();
    if !generation.is_empty() {
        info!(models = ?generation, "Image generation available (loaded on first use)");
    }

    residency.preload(&catalog::preload_plan(&caps)).await?;
    Ok(caps)
}

/// Build the API router
///
/// - `GET /api/ping` - liveness, never authenticated
/// - `GET /api/capabilities` - what this machine can do
/// - `GET /api/queue` - pending tasks and resident models
/// - `POST /api/upscale`, `POST /api/image`, `POST /api/caption` - queued GPU work
#[instrument(skip(state))]
pub fn build_router(state: AppState) -> Router {
    info!("Building router");
    let api = Router::new()
        .route("/capabilities", get(handlers::capabilities))
        .route("/queue", get(handlers::queue_status))
        .route("/upscale", post(handlers::upscale))
        .route("/image", post(handlers::generate))
        .route("/caption", post(handlers::caption))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.api_keys),
            auth::require_bearer,
        ))
        .route("/ping", get(handlers::ping));

    Router::new()
        .nest("/api", api)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
///
/// Installs the global recorder, so call it at most once per process.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .enable_response_body_size(true)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::Exact)
        .with_default_metrics()
        .build_pair()
}
