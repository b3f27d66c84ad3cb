//! Tool dispatcher: validates a `ToolInvocation` against the registry, maps
//! it onto exactly one `CalendarOperation`, calls the provider with a fresh
//! credential, and normalizes the result.
//!
//! The provider call is at-most-once: no retry, no backoff. Every failure is
//! surfaced as a `DispatchError` which renders as `{"error": "..."}`.

use std::sync::Arc;
use std::time::Instant;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Map, Value};

use crate::calendar::{
    CalendarOperation, CalendarProvider, EventDraft, EventPatch, EventQuery, UpstreamError,
    PRIMARY_CALENDAR,
};
use crate::models::{ErrorBody, NormalizedEvent, ToolInvocation};
use crate::oauth::{CredentialError, CredentialStore};
use crate::tools::{ToolDefinition, ToolRegistry};

const DEFAULT_MAX_RESULTS: u32 = 10;
/// Largest page the Calendar API accepts for events.list.
const MAX_RESULTS_LIMIT: u32 = 2500;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchErrorKind {
    UnknownTool,
    InvalidParameters,
    CredentialError,
    UpstreamError,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid parameters for {tool}: {message}")]
    InvalidParameters { tool: String, message: String },

    /// The request body is not a `{toolName, parameters}` object.
    #[error("Malformed tool invocation: {0}")]
    MalformedRequest(String),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl DispatchError {
    fn invalid(tool: &str, message: impl Into<String>) -> Self {
        DispatchError::InvalidParameters { tool: tool.to_string(), message: message.into() }
    }

    pub fn kind(&self) -> DispatchErrorKind {
        match self {
            DispatchError::UnknownTool(_) => DispatchErrorKind::UnknownTool,
            DispatchError::InvalidParameters { .. } | DispatchError::MalformedRequest(_) => {
                DispatchErrorKind::InvalidParameters
            }
            DispatchError::Credential(_) => DispatchErrorKind::CredentialError,
            DispatchError::Upstream(_) => DispatchErrorKind::UpstreamError,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.kind() {
            DispatchErrorKind::UnknownTool | DispatchErrorKind::InvalidParameters => {
                StatusCode::BAD_REQUEST
            }
            DispatchErrorKind::CredentialError => StatusCode::UNAUTHORIZED,
            DispatchErrorKind::UpstreamError => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(kind = ?self.kind(), "dispatch failed ({}): {}", status.as_u16(), self);
        } else {
            tracing::warn!(kind = ?self.kind(), "dispatch rejected ({}): {}", status.as_u16(), self);
        }
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

// ---------------------------------------------------------------------------
// Parameter extraction
// ---------------------------------------------------------------------------

/// String-valued parameter. Scalars are accepted and stringified; `null`
/// reads as absent.
fn string_param(tool: &str, params: &Map<String, Value>, name: &str) -> Result<Option<String>, DispatchError> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(v @ (Value::Number(_) | Value::Bool(_))) => Ok(Some(v.to_string())),
        Some(_) => Err(DispatchError::invalid(tool, format!("'{name}' must be a scalar value"))),
    }
}

fn require_string(tool: &str, params: &Map<String, Value>, name: &str) -> Result<String, DispatchError> {
    string_param(tool, params, name)?
        .ok_or_else(|| DispatchError::invalid(tool, format!("missing required parameter(s): {name}")))
}

/// RFC 3339 timestamp, passed through exactly as given once it parses.
fn timestamp_param(tool: &str, params: &Map<String, Value>, name: &str) -> Result<Option<String>, DispatchError> {
    let Some(raw) = string_param(tool, params, name)? else {
        return Ok(None);
    };
    chrono::DateTime::parse_from_rfc3339(&raw).map_err(|e| {
        DispatchError::invalid(tool, format!("'{name}' must be an RFC 3339 timestamp ({e})"))
    })?;
    Ok(Some(raw))
}

fn max_results_param(tool: &str, params: &Map<String, Value>) -> Result<u32, DispatchError> {
    let parsed = match params.get("maxResults") {
        None | Some(Value::Null) => return Ok(DEFAULT_MAX_RESULTS),
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        Some(_) => None,
    };
    match parsed {
        Some(n) if n >= 1 => Ok(n.min(MAX_RESULTS_LIMIT as u64) as u32),
        _ => Err(DispatchError::invalid(tool, "'maxResults' must be a positive integer")),
    }
}

fn calendar_param(tool: &str, params: &Map<String, Value>) -> Result<String, DispatchError> {
    Ok(string_param(tool, params, "calendarId")?.unwrap_or_else(|| PRIMARY_CALENDAR.to_string()))
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    credentials: Arc<CredentialStore>,
    provider: Arc<dyn CalendarProvider>,
    window_year: i32,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        credentials: Arc<CredentialStore>,
        provider: Arc<dyn CalendarProvider>,
        window_year: i32,
    ) -> Self {
        Self { registry, credentials, provider, window_year }
    }

    /// The window used when `list-events` gets no `timeMin`/`timeMax`:
    /// the whole reference year, UTC.
    pub fn default_window(&self) -> (String, String) {
        (
            format!("{:04}-01-01T00:00:00Z", self.window_year),
            format!("{:04}-12-31T23:59:59Z", self.window_year),
        )
    }

    pub fn default_query(&self) -> EventQuery {
        let (time_min, time_max) = self.default_window();
        EventQuery {
            calendar_id: PRIMARY_CALENDAR.to_string(),
            time_min,
            time_max,
            max_results: DEFAULT_MAX_RESULTS,
        }
    }

    /// Validate, route and run one tool invocation.
    pub async fn dispatch(&self, invocation: ToolInvocation) -> Result<Value, DispatchError> {
        let started = Instant::now();
        let tool = invocation.tool_name.as_str();

        let def = self
            .registry
            .resolve(tool)
            .ok_or_else(|| DispatchError::UnknownTool(tool.to_string()))?;

        let missing = def.missing_params(&invocation.parameters);
        if !missing.is_empty() {
            return Err(DispatchError::invalid(
                def.name,
                format!("missing required parameter(s): {}", missing.join(", ")),
            ));
        }

        let op = self.build_operation(def, &invocation.parameters)?;
        let result = match self.call(&op).await {
            Ok(raw) => shape_result(&op, raw),
            Err(e) => Err(e),
        };

        match &result {
            Ok(_) => tracing::info!(
                tool = def.name,
                op = op.label(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "tool dispatched"
            ),
            Err(e) => tracing::warn!(
                tool = def.name,
                op = op.label(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "tool failed: {}",
                e
            ),
        }
        result
    }

    /// `list-events` with typed results; the stream snapshot goes through here.
    pub async fn list_events(&self, query: EventQuery) -> Result<Vec<NormalizedEvent>, DispatchError> {
        let raw = self.call(&CalendarOperation::ListEvents(query)).await?;
        normalize_items(&raw)
    }

    /// Events in the default window, as pushed when a stream opens.
    pub async fn snapshot(&self) -> Result<Vec<NormalizedEvent>, DispatchError> {
        self.list_events(self.default_query()).await
    }

    fn build_operation(
        &self,
        def: &ToolDefinition,
        params: &Map<String, Value>,
    ) -> Result<CalendarOperation, DispatchError> {
        let tool = def.name;
        let op = match tool {
            "list-calendars" => CalendarOperation::ListCalendars,
            "get-calendar" => CalendarOperation::GetCalendar {
                calendar_id: require_string(tool, params, "calendarId")?,
            },
            "list-events" => {
                let defaults = self.default_query();
                CalendarOperation::ListEvents(EventQuery {
                    calendar_id: calendar_param(tool, params)?,
                    time_min: timestamp_param(tool, params, "timeMin")?.unwrap_or(defaults.time_min),
                    time_max: timestamp_param(tool, params, "timeMax")?.unwrap_or(defaults.time_max),
                    max_results: max_results_param(tool, params)?,
                })
            }
            "get-event" => CalendarOperation::GetEvent {
                calendar_id: calendar_param(tool, params)?,
                event_id: require_string(tool, params, "eventId")?,
            },
            "create-event" => CalendarOperation::CreateEvent {
                calendar_id: calendar_param(tool, params)?,
                event: EventDraft {
                    summary: require_string(tool, params, "summary")?,
                    start: require_timestamp(tool, params, "start")?,
                    end: require_timestamp(tool, params, "end")?,
                    description: string_param(tool, params, "description")?,
                },
            },
            "update-event" => CalendarOperation::UpdateEvent {
                calendar_id: calendar_param(tool, params)?,
                event_id: require_string(tool, params, "eventId")?,
                patch: EventPatch {
                    summary: string_param(tool, params, "summary")?,
                    start: timestamp_param(tool, params, "start")?,
                    end: timestamp_param(tool, params, "end")?,
                },
            },
            "delete-event" => CalendarOperation::DeleteEvent {
                calendar_id: calendar_param(tool, params)?,
                event_id: require_string(tool, params, "eventId")?,
            },
            "list-colors" => CalendarOperation::ListColors,
            // Registry and routing table are declared together; a mismatch is a bug.
            other => return Err(DispatchError::UnknownTool(other.to_string())),
        };
        Ok(op)
    }

    async fn call(&self, op: &CalendarOperation) -> Result<Value, DispatchError> {
        let credential = self.credentials.get_valid_credential().await?;
        match self.provider.execute(op, &credential.access_token).await {
            Ok(raw) => Ok(raw),
            Err(e) => {
                if e.status == Some(401) {
                    self.credentials.invalidate_access_token(&credential.access_token).await;
                }
                Err(e.into())
            }
        }
    }
}

fn require_timestamp(tool: &str, params: &Map<String, Value>, name: &str) -> Result<String, DispatchError> {
    timestamp_param(tool, params, name)?
        .ok_or_else(|| DispatchError::invalid(tool, format!("missing required parameter(s): {name}")))
}

// ---------------------------------------------------------------------------
// Result shaping
// ---------------------------------------------------------------------------

fn normalize_event(item: &Value) -> Result<NormalizedEvent, DispatchError> {
    NormalizedEvent::from_provider(item).ok_or_else(|| {
        let id = item.get("id").and_then(|v| v.as_str()).unwrap_or("<no id>");
        UpstreamError::new(None, format!("provider returned event {id} without a start or end")).into()
    })
}

fn normalize_items(raw: &Value) -> Result<Vec<NormalizedEvent>, DispatchError> {
    raw.get("items")
        .and_then(|i| i.as_array())
        .map(|items| items.iter().map(normalize_event).collect())
        .unwrap_or_else(|| Ok(Vec::new()))
}

fn shape_result(op: &CalendarOperation, raw: Value) -> Result<Value, DispatchError> {
    let shaped = match op {
        CalendarOperation::ListEvents(_) => json!({ "events": normalize_items(&raw)? }),
        CalendarOperation::GetEvent { .. }
        | CalendarOperation::CreateEvent { .. }
        | CalendarOperation::UpdateEvent { .. } => json!(normalize_event(&raw)?),
        CalendarOperation::DeleteEvent { calendar_id, event_id } => json!({
            "message": format!("Event {event_id} deleted from calendar {calendar_id}"),
        }),
        CalendarOperation::ListCalendars
        | CalendarOperation::GetCalendar { .. }
        | CalendarOperation::ListColors => raw,
    };
    Ok(shaped)
}
