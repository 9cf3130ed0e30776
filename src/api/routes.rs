//! API route definitions

use crate::launcher::ServerHandle;
use crate::proxy::{EmbedClient, GenerateClient};
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use tower::ServiceBuilder;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::handlers;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub handle: Arc<ServerHandle>,
    pub embed: Arc<EmbedClient>,
    pub generate: Arc<GenerateClient>,
    pub in_flight: Arc<AtomicUsize>,
    pub prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
}

/// Create the main API router.
/// Proxied routes share one concurrency ceiling; status routes stay outside
/// it so they answer even when the ceiling is saturated.
pub fn create_router(state: AppState, max_concurrent_requests: usize) -> Router {
    let proxied = Router::new()
        .route("/embed", post(handlers::embed))
        .route("/generate", post(handlers::generate))
        .route("/completion/{question}", get(handlers::completion))
        .layer(GlobalConcurrencyLimitLayer::new(max_concurrent_requests));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/stats", get(handlers::stats))
        .route("/metrics", get(handlers::metrics))
        .merge(proxied)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}
