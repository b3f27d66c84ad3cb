// ---------------------------------------------------------------------------
// handlers/tools.rs: capability discovery and tool dispatch
// ---------------------------------------------------------------------------

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use serde_json::Value;

use crate::dispatch::DispatchError;
use crate::models::{ErrorBody, ToolInvocation};
use crate::state::AppState;

/// GET /tools: the catalog as `{name, description, parameters}` records.
#[utoipa::path(get, path = "/tools", tag = "tools",
    responses((status = 200, description = "Tool catalog in declaration order", body = Value))
)]
pub async fn list_tools(State(state): State<AppState>) -> Json<Vec<Value>> {
    Json(state.registry.descriptors())
}

/// POST /tools/call: validate, authorize and run one tool.
#[utoipa::path(post, path = "/tools/call", tag = "tools",
    request_body = ToolInvocation,
    responses(
        (status = 200, description = "Normalized tool result", body = Value),
        (status = 400, description = "Unknown tool or invalid parameters", body = ErrorBody),
        (status = 401, description = "No usable credential", body = ErrorBody),
        (status = 502, description = "Calendar provider failure", body = ErrorBody)
    )
)]
pub async fn call_tool(
    State(state): State<AppState>,
    body: Result<Json<ToolInvocation>, JsonRejection>,
) -> Result<Json<Value>, DispatchError> {
    let Json(invocation) = body.map_err(|e| DispatchError::MalformedRequest(e.body_text()))?;
    state.dispatcher.dispatch(invocation).await.map(Json)
}
