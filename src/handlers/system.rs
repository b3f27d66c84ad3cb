// ---------------------------------------------------------------------------
// handlers/system.rs: health and readiness
// ---------------------------------------------------------------------------

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::models::HealthResponse;
use crate::state::AppState;

#[utoipa::path(get, path = "/api/health", tag = "health",
    responses((status = 200, description = "Gateway health", body = HealthResponse))
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let authorized = state.credentials.status().await.authorized;
    Json(HealthResponse {
        status: if state.is_ready() { "ok" } else { "starting" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        app: "calendar-gateway".to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        tools: state.registry.len(),
        active_streams: state.sessions.active_count().await,
        authorized,
    })
}

/// GET /api/health/ready: readiness probe, no locks taken.
#[utoipa::path(get, path = "/api/health/ready", tag = "health",
    responses(
        (status = 200, description = "Gateway ready", body = Value),
        (status = 503, description = "Gateway still starting", body = Value)
    )
)]
pub async fn readiness(State(state): State<AppState>) -> Response {
    let ready = state.is_ready();
    let body = json!({ "ready": ready, "uptime_seconds": state.start_time.elapsed().as_secs() });
    if ready {
        (StatusCode::OK, Json(body)).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    }
}
