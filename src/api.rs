use std::{convert::Infallible, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{Sse, sse::Event},
    routing::{get, post},
};
use futures::Stream;

use crate::{
    error::EngineError,
    metrics::MetricsRegistry,
    models::{ExecuteRequest, InputRequest, StopResponse},
    session::SessionManager,
    stream::{self, StopGuard},
};

#[derive(Clone)]
pub struct AppState {
    manager: Arc<SessionManager>,
    metrics: Arc<MetricsRegistry>,
}

pub fn routes(manager: Arc<SessionManager>, metrics: Arc<MetricsRegistry>) -> Router {
    let state = AppState { manager, metrics };
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(render_metrics))
        .route("/v1/sessions/{id}/run", post(run))
        .route("/v1/sessions/{id}/input", post(input))
        .route("/v1/sessions/{id}/stop", post(stop))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn render_metrics(State(state): State<AppState>) -> (StatusCode, String) {
    (StatusCode::OK, state.metrics.render_prometheus())
}

/// Accepts a source bundle and answers with the run's event stream. The
/// stream carries `output`/`error` events as the program produces them and
/// exactly one `end`; dropping the response body (client disconnect) stops
/// the run and destroys its sandbox.
async fn run(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, EngineError> {
    let run = state.manager.start(&session_id, request).await?;
    let guard = StopGuard::new(state.manager.clone(), session_id, run.generation);
    Ok(stream::sse_response(run.events, guard))
}

async fn input(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<InputRequest>,
) -> Result<StatusCode, EngineError> {
    state.manager.input(&session_id, request.input).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn stop(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<StopResponse> {
    state.manager.stop(&session_id).await;
    Json(StopResponse { stopped: true })
}
