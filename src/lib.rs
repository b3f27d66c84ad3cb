pub mod auth;
pub mod calendar;
pub mod config;
pub mod dispatch;
pub mod handlers;
pub mod models;
pub mod oauth;
pub mod state;
pub mod streaming;
pub mod tools;

#[cfg(test)]
mod testing;

use axum::middleware;
use axum::routing::{get, post};
use axum::{Json, Router};
use utoipa::OpenApi;

use state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(title = "Calendar Gateway", description = "Google Calendar tools and event stream for automation clients"),
    paths(
        handlers::health,
        handlers::readiness,
        handlers::list_tools,
        handlers::call_tool,
        oauth::auth_status,
    ),
    components(schemas(
        models::ToolInvocation,
        models::ErrorBody,
        models::HealthResponse,
        models::NormalizedEvent,
        oauth::CredentialStatus,
    )),
    tags(
        (name = "health", description = "Liveness and readiness"),
        (name = "tools", description = "Tool discovery and dispatch"),
        (name = "auth", description = "Calendar authorization"),
    )
)]
pub struct ApiDoc;

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Build the application router with the given state.
/// Kept out of `main()` so integration tests can drive the app without a port.
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/tools", get(handlers::list_tools))
        .route("/tools/call", post(handlers::call_tool))
        .route("/sse", get(streaming::stream_events))
        .route("/mcp", post(handlers::mcp_handler))
        .route("/api/streams", get(streaming::list_streams))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_auth));

    Router::new()
        // Health
        .route("/api/health", get(handlers::health))
        .route("/api/health/ready", get(handlers::readiness))
        .route("/api/openapi.json", get(openapi_json))
        // Authorization
        .route("/auth", get(oauth::auth_redirect))
        .route("/auth/callback", get(oauth::auth_callback))
        .route("/api/auth/status", get(oauth::auth_status))
        .merge(protected)
        .with_state(state)
}
