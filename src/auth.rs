// Optional shared-secret guard for the tool and stream routes.
// With AUTH_SECRET unset every request passes (local development).

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};

use crate::models::ErrorBody;
use crate::state::AppState;

/// Accepts `Authorization: Bearer <secret>` or, for clients that cannot set
/// headers on an event stream, `?token=<secret>`.
pub async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(secret) = state.config.auth_secret.as_deref() else {
        return next.run(request).await;
    };

    let bearer = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let authorized = match bearer {
        Some(token) => token == secret,
        None => query_token_matches(request.uri().query().unwrap_or(""), secret),
    };

    if authorized {
        next.run(request).await
    } else {
        tracing::warn!(path = %request.uri().path(), "auth: rejected request without valid secret");
        (
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody { error: "Missing or invalid access secret".into() }),
        )
            .into_response()
    }
}

fn query_token_matches(query: &str, secret: &str) -> bool {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .any(|(key, value)| key == "token" && value == secret)
}
