//! API request handlers

use super::models::{
    EmbedItem, GenerateTextRequest, GenerateTextResponse, HealthResponse, StatsResponse,
};
use super::routes::AppState;
use crate::config::ServerRole;
use crate::error::ApiError;
use crate::launcher::ServerState;
use axum::{
    Json,
    extract::{Path, State},
    response::sse::{Event, Sse},
};
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// GET /health - Sidecar and upstream server state
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: state.handle.state().await,
        model_id: state.handle.config.model_id.clone(),
        timestamp: chrono::Utc::now(),
    })
}

/// GET /stats - Backlog and runner counts for this container
pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let num_total_runners = match state.handle.state().await {
        ServerState::Ready => 1,
        _ => 0,
    };

    Json(StatsResponse {
        backlog: state.in_flight.load(Ordering::SeqCst),
        num_total_runners,
    })
}

/// GET /metrics - Prometheus metrics
pub async fn metrics(State(state): State<AppState>) -> String {
    state.prometheus_handle.render()
}

/// POST /embed - Batched embedding of (id, text) pairs
pub async fn embed(
    State(state): State<AppState>,
    Json(items): Json<Vec<EmbedItem>>,
) -> Result<Json<HashMap<u64, Vec<f32>>>, ApiError> {
    ensure_role(&state, ServerRole::Embedding)?;

    let _guard = InFlightGuard::enter(&state);
    let pairs: Vec<(u64, String)> = items.into_iter().map(|item| (item.id, item.text)).collect();
    let vectors = state.embed.embed(&state.handle, &pairs).await?;

    Ok(Json(vectors))
}

/// POST /generate - Blocking text generation for one prompt
pub async fn generate(
    State(state): State<AppState>,
    Json(req): Json<GenerateTextRequest>,
) -> Result<Json<GenerateTextResponse>, ApiError> {
    ensure_role(&state, ServerRole::Generation)?;

    let _guard = InFlightGuard::enter(&state);
    let generated_text = state
        .generate
        .generate(&state.handle, &req.prompt, req.max_new_tokens)
        .await?;

    Ok(Json(GenerateTextResponse { generated_text }))
}

/// GET /completion/{question} - Server-sent-event stream of generated fragments
pub async fn completion(
    State(state): State<AppState>,
    Path(question): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    ensure_role(&state, ServerRole::Generation)?;

    let question = urlencoding::decode(&question)
        .map_err(|e| ApiError::BadRequest(format!("invalid percent-encoding: {}", e)))?
        .into_owned();

    let guard = InFlightGuard::enter(&state);
    let fragments = state
        .generate
        .generate_stream(state.handle.clone(), &question, None);

    // The guard rides along with the stream; dropping the SSE response
    // (client went away) releases the in-flight slot and cancels upstream.
    let events = fragments.map(move |fragment| {
        let _held = &guard;
        match fragment {
            Ok(text) => Event::default().json_data(serde_json::json!({ "text": text })),
            Err(e) => Err(axum::Error::new(e)),
        }
    });

    Ok(Sse::new(events))
}

fn ensure_role(state: &AppState, role: ServerRole) -> Result<(), ApiError> {
    if state.handle.config.role != role {
        return Err(ApiError::BadRequest(format!(
            "endpoint requires a {:?} server, this sidecar runs {:?}",
            role, state.handle.config.role
        )));
    }
    Ok(())
}

/// Counts a proxy call for /stats and the in-flight gauge
struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl InFlightGuard {
    fn enter(state: &AppState) -> Self {
        let count = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        crate::metrics::update_in_flight(count);
        Self {
            counter: state.in_flight.clone(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let count = self.counter.fetch_sub(1, Ordering::SeqCst) - 1;
        crate::metrics::update_in_flight(count);
    }
}
