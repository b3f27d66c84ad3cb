// Calendar Gateway: downstream provider client
//
// `CalendarOperation` is the closed set of provider calls the dispatcher can
// make. `CalendarProvider` is the injection point: production uses
// `GoogleCalendarClient` (Calendar API v3 over reqwest), tests plug in stubs.

use std::time::Duration;

use reqwest::{Client, Method};
use serde_json::{json, Map, Value};
use url::Url;

pub const PRIMARY_CALENDAR: &str = "primary";

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Time-window query for `list-events`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventQuery {
    pub calendar_id: String,
    pub time_min: String,
    pub time_max: String,
    pub max_results: u32,
}

/// Fields for a new timed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDraft {
    pub summary: String,
    pub start: String,
    pub end: String,
    pub description: Option<String>,
}

/// Partial update; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventPatch {
    pub summary: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalendarOperation {
    ListCalendars,
    GetCalendar { calendar_id: String },
    ListEvents(EventQuery),
    GetEvent { calendar_id: String, event_id: String },
    CreateEvent { calendar_id: String, event: EventDraft },
    UpdateEvent { calendar_id: String, event_id: String, patch: EventPatch },
    DeleteEvent { calendar_id: String, event_id: String },
    ListColors,
}

impl CalendarOperation {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            CalendarOperation::ListCalendars => "calendarList.list",
            CalendarOperation::GetCalendar { .. } => "calendars.get",
            CalendarOperation::ListEvents(_) => "events.list",
            CalendarOperation::GetEvent { .. } => "events.get",
            CalendarOperation::CreateEvent { .. } => "events.insert",
            CalendarOperation::UpdateEvent { .. } => "events.patch",
            CalendarOperation::DeleteEvent { .. } => "events.delete",
            CalendarOperation::ListColors => "colors.get",
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// The provider rejected or failed a call. `message` is passed through as-is.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct UpstreamError {
    pub status: Option<u16>,
    pub message: String,
}

impl UpstreamError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }
}

// ---------------------------------------------------------------------------
// Trait: CalendarProvider (dependency injection point)
// ---------------------------------------------------------------------------

/// One at-most-once call against the remote calendar service.
///
/// Implementations must be Send + Sync so they can be shared across request
/// handlers and stream sessions via `Arc`.
#[async_trait::async_trait]
pub trait CalendarProvider: Send + Sync {
    async fn execute(
        &self,
        op: &CalendarOperation,
        access_token: &str,
    ) -> Result<Value, UpstreamError>;
}

// ---------------------------------------------------------------------------
// Google Calendar v3
// ---------------------------------------------------------------------------

pub struct GoogleCalendarClient {
    client: Client,
    base: Url,
    timeout: Duration,
}

impl GoogleCalendarClient {
    pub fn new(client: Client, base: &str, timeout: Duration) -> Result<Self, url::ParseError> {
        Ok(Self { client, base: Url::parse(base)?, timeout })
    }

    /// Append percent-encoded path segments to the API base.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, UpstreamError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| UpstreamError::new(None, "calendar API base URL cannot be a base"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request_for(&self, op: &CalendarOperation) -> Result<(Method, Url, Option<Value>), UpstreamError> {
        let req = match op {
            CalendarOperation::ListCalendars => {
                (Method::GET, self.endpoint(&["users", "me", "calendarList"])?, None)
            }
            CalendarOperation::GetCalendar { calendar_id } => {
                (Method::GET, self.endpoint(&["calendars", calendar_id.as_str()])?, None)
            }
            CalendarOperation::ListEvents(q) => {
                let mut url = self.endpoint(&["calendars", q.calendar_id.as_str(), "events"])?;
                url.query_pairs_mut()
                    .append_pair("timeMin", &q.time_min)
                    .append_pair("timeMax", &q.time_max)
                    .append_pair("maxResults", &q.max_results.to_string())
                    .append_pair("singleEvents", "true")
                    .append_pair("orderBy", "startTime");
                (Method::GET, url, None)
            }
            CalendarOperation::GetEvent { calendar_id, event_id } => (
                Method::GET,
                self.endpoint(&["calendars", calendar_id.as_str(), "events", event_id.as_str()])?,
                None,
            ),
            CalendarOperation::CreateEvent { calendar_id, event } => {
                let mut body = json!({
                    "summary": event.summary,
                    "start": { "dateTime": event.start },
                    "end": { "dateTime": event.end },
                });
                if let Some(desc) = &event.description {
                    body["description"] = json!(desc);
                }
                (
                    Method::POST,
                    self.endpoint(&["calendars", calendar_id.as_str(), "events"])?,
                    Some(body),
                )
            }
            CalendarOperation::UpdateEvent { calendar_id, event_id, patch } => {
                let mut body = Map::new();
                if let Some(summary) = &patch.summary {
                    body.insert("summary".into(), json!(summary));
                }
                if let Some(start) = &patch.start {
                    body.insert("start".into(), json!({ "dateTime": start }));
                }
                if let Some(end) = &patch.end {
                    body.insert("end".into(), json!({ "dateTime": end }));
                }
                (
                    Method::PATCH,
                    self.endpoint(&["calendars", calendar_id.as_str(), "events", event_id.as_str()])?,
                    Some(Value::Object(body)),
                )
            }
            CalendarOperation::DeleteEvent { calendar_id, event_id } => (
                Method::DELETE,
                self.endpoint(&["calendars", calendar_id.as_str(), "events", event_id.as_str()])?,
                None,
            ),
            CalendarOperation::ListColors => (Method::GET, self.endpoint(&["colors"])?, None),
        };
        Ok(req)
    }
}

#[async_trait::async_trait]
impl CalendarProvider for GoogleCalendarClient {
    async fn execute(
        &self,
        op: &CalendarOperation,
        access_token: &str,
    ) -> Result<Value, UpstreamError> {
        let (method, url, body) = self.request_for(op)?;

        let mut builder = self
            .client
            .request(method, url)
            .bearer_auth(access_token)
            .timeout(self.timeout);
        if let Some(body) = &body {
            builder = builder.json(body);
        }

        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                UpstreamError::new(None, format!("calendar API request timed out: {e}"))
            } else {
                UpstreamError::new(None, format!("calendar API request failed: {e}"))
            }
        })?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| UpstreamError::new(Some(status.as_u16()), e.to_string()))?;

        if !status.is_success() {
            tracing::warn!(op = op.label(), status = status.as_u16(), "calendar API rejected call");
            return Err(UpstreamError::new(Some(status.as_u16()), provider_message(&text, status)));
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| {
            UpstreamError::new(Some(status.as_u16()), format!("invalid JSON from calendar API: {e}"))
        })
    }
}

/// Google error bodies look like `{"error": {"code": 404, "message": "Not Found"}}`.
fn provider_message(body: &str, status: reqwest::StatusCode) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("error_description"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                format!("calendar API returned {status}")
            } else {
                body.to_string()
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> GoogleCalendarClient {
        GoogleCalendarClient::new(
            Client::new(),
            "https://www.googleapis.com/calendar/v3",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn list_events_builds_single_instance_ordered_query() {
        let op = CalendarOperation::ListEvents(EventQuery {
            calendar_id: PRIMARY_CALENDAR.into(),
            time_min: "2025-01-01T00:00:00Z".into(),
            time_max: "2025-12-31T23:59:59Z".into(),
            max_results: 10,
        });
        let (method, url, body) = client().request_for(&op).unwrap();
        assert_eq!(method, Method::GET);
        assert_eq!(url.path(), "/calendar/v3/calendars/primary/events");
        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(query.contains(&("singleEvents".into(), "true".into())));
        assert!(query.contains(&("orderBy".into(), "startTime".into())));
        assert!(query.contains(&("maxResults".into(), "10".into())));
        assert!(body.is_none());
    }

    #[test]
    fn calendar_ids_are_percent_encoded() {
        let op = CalendarOperation::GetEvent {
            calendar_id: "team/ops@group.calendar.google.com".into(),
            event_id: "abc123".into(),
        };
        let (_, url, _) = client().request_for(&op).unwrap();
        assert_eq!(
            url.path(),
            "/calendar/v3/calendars/team%2Fops@group.calendar.google.com/events/abc123"
        );
    }

    #[test]
    fn patch_body_only_carries_supplied_fields() {
        let op = CalendarOperation::UpdateEvent {
            calendar_id: PRIMARY_CALENDAR.into(),
            event_id: "abc123".into(),
            patch: EventPatch { summary: Some("Retro".into()), ..EventPatch::default() },
        };
        let (method, _, body) = client().request_for(&op).unwrap();
        assert_eq!(method, Method::PATCH);
        assert_eq!(body.unwrap(), json!({ "summary": "Retro" }));
    }

    #[test]
    fn provider_message_prefers_google_error_message() {
        let msg = provider_message(
            r#"{"error":{"code":404,"message":"Not Found"}}"#,
            reqwest::StatusCode::NOT_FOUND,
        );
        assert_eq!(msg, "Not Found");
        let msg = provider_message("", reqwest::StatusCode::BAD_GATEWAY);
        assert!(msg.contains("502"));
    }
}
