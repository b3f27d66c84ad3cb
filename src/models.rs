use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// A single tool call as received from a client. Parameters are unvalidated.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub tool_name: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub parameters: Map<String, Value>,
}

impl ToolInvocation {
    pub fn new(tool_name: impl Into<String>, parameters: Value) -> Self {
        let parameters = match parameters {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self { tool_name: tool_name.into(), parameters }
    }
}

/// Error envelope returned by every failing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
}

// ---------------------------------------------------------------------------
// Calendar events
// ---------------------------------------------------------------------------

/// Provider event projected onto a single resolved start/end instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct NormalizedEvent {
    pub id: String,
    pub summary: String,
    pub start: String,
    pub end: String,
}

impl NormalizedEvent {
    /// Project a provider event resource. `None` when the id or either
    /// boundary is missing entirely.
    pub fn from_provider(item: &Value) -> Option<Self> {
        Some(Self {
            id: item.get("id")?.as_str()?.to_string(),
            summary: item
                .get("summary")
                .and_then(|s| s.as_str())
                .unwrap_or_default()
                .to_string(),
            start: resolve_instant(item.get("start")?)?,
            end: resolve_instant(item.get("end")?)?,
        })
    }
}

/// Timed instant when present, else the all-day date.
fn resolve_instant(boundary: &Value) -> Option<String> {
    boundary
        .get("dateTime")
        .and_then(|v| v.as_str())
        .or_else(|| boundary.get("date").and_then(|v| v.as_str()))
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Streaming frames
// ---------------------------------------------------------------------------

/// Payload of one pushed stream frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum StreamFrame {
    Snapshot {
        events: Vec<NormalizedEvent>,
    },
    Error {
        error: String,
    },
    KeepAlive {
        #[serde(rename = "keepAlive")]
        keep_alive: bool,
    },
}

impl StreamFrame {
    pub fn heartbeat() -> Self {
        StreamFrame::KeepAlive { keep_alive: true }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, StreamFrame::KeepAlive { .. })
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub app: String,
    pub uptime_seconds: u64,
    pub tools: usize,
    pub active_streams: usize,
    pub authorized: bool,
}
