// ---------------------------------------------------------------------------
// handlers/mcp.rs: the tool catalog as a JSON-RPC 2.0 endpoint
// ---------------------------------------------------------------------------
//
// Supported methods:
// - `initialize`: server info + capabilities
// - `notifications/initialized`: client ack (no-op)
// - `ping`
// - `tools/list`: registry with JSON Schema `inputSchema`
// - `tools/call`: same dispatcher as POST /tools/call

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Map, Value};

use crate::models::ToolInvocation;
use crate::state::AppState;

const PROTOCOL_VERSION: &str = "2024-11-05";

/// POST /mcp
pub async fn mcp_handler(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> (StatusCode, Json<Value>) {
    let request = match body {
        Ok(Json(request)) => request,
        Err(e) => {
            tracing::debug!("MCP: unparseable request: {}", e.body_text());
            return (
                StatusCode::OK,
                Json(json_rpc_error(&Value::Null, -32700, &format!("Parse error: {}", e.body_text()))),
            );
        }
    };
    let method = request.get("method").and_then(|m| m.as_str()).unwrap_or("");
    let id = request.get("id").cloned().unwrap_or(Value::Null);

    tracing::debug!(method = %method, "MCP: incoming request");

    let result = match method {
        "initialize" => handle_initialize(&id),
        "notifications/initialized" => return (StatusCode::OK, Json(json!({}))),
        "ping" => json_rpc_result(&id, json!({})),
        "tools/list" => handle_tools_list(&state, &id),
        "tools/call" => handle_tools_call(&state, &request, &id).await,
        _ => json_rpc_error(&id, -32601, &format!("Method not found: {method}")),
    };

    (StatusCode::OK, Json(result))
}

fn handle_initialize(id: &Value) -> Value {
    json_rpc_result(
        id,
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "tools": { "listChanged": false }
            },
            "serverInfo": {
                "name": "calendar-gateway",
                "version": env!("CARGO_PKG_VERSION")
            },
            "instructions": "Google Calendar tools: list, read, create, update and delete events; list calendars and colors."
        }),
    )
}

fn handle_tools_list(state: &AppState, id: &Value) -> Value {
    let tools: Vec<Value> = state
        .registry
        .list_tools()
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "inputSchema": t.input_schema(),
            })
        })
        .collect();
    json_rpc_result(id, json!({ "tools": tools }))
}

async fn handle_tools_call(state: &AppState, request: &Value, id: &Value) -> Value {
    let params = request.get("params").cloned().unwrap_or_else(|| json!({}));
    let tool_name = params.get("name").and_then(|n| n.as_str()).unwrap_or("");
    if tool_name.is_empty() {
        return json_rpc_error(id, -32602, "Missing 'name' in params");
    }
    let arguments = match params.get("arguments") {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };

    tracing::info!(tool = %tool_name, "MCP: tools/call");

    let invocation = ToolInvocation { tool_name: tool_name.to_string(), parameters: arguments };
    let (text, is_error) = match state.dispatcher.dispatch(invocation).await {
        Ok(value) => (serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string()), false),
        Err(e) => (json!({ "error": e.to_string() }).to_string(), true),
    };

    json_rpc_result(
        id,
        json!({
            "content": [{ "type": "text", "text": text }],
            "isError": is_error
        }),
    )
}

fn json_rpc_result(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn json_rpc_error(id: &Value, code: i32, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
}
