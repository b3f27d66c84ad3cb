// Shared fixtures for router-level tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use http_body_util::BodyExt;
use serde_json::{json, Value};

use calendar_gateway::calendar::{CalendarOperation, CalendarProvider, UpstreamError};
use calendar_gateway::config::Config;
use calendar_gateway::oauth::{CredentialError, CredentialStore, TokenEndpoint, TokenGrant};
use calendar_gateway::state::AppState;

#[derive(Default)]
pub struct FakeTokenEndpoint {
    pub exchanges: AtomicUsize,
    pub refreshes: AtomicUsize,
}

#[async_trait::async_trait]
impl TokenEndpoint for FakeTokenEndpoint {
    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenGrant, CredentialError> {
        if code_verifier.is_none() {
            return Err(CredentialError::Rejected("missing code_verifier".into()));
        }
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        Ok(TokenGrant {
            access_token: format!("access-{code}"),
            refresh_token: Some(format!("refresh-{code}")),
            expires_in: Some(3600),
        })
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, CredentialError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(TokenGrant { access_token: "fresh-access".into(), refresh_token: None, expires_in: Some(3600) })
    }
}

/// Records every operation; answers with a small fixed calendar.
#[derive(Default)]
pub struct FakeCalendar {
    pub ops: Mutex<Vec<CalendarOperation>>,
    pub fail_with: Option<UpstreamError>,
}

impl FakeCalendar {
    pub fn failing(status: u16, message: &str) -> Self {
        Self { fail_with: Some(UpstreamError::new(Some(status), message)), ..Self::default() }
    }

    pub fn recorded(&self) -> Vec<CalendarOperation> {
        self.ops.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl CalendarProvider for FakeCalendar {
    async fn execute(&self, op: &CalendarOperation, access_token: &str) -> Result<Value, UpstreamError> {
        assert!(!access_token.is_empty());
        self.ops.lock().unwrap().push(op.clone());
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }
        Ok(match op {
            CalendarOperation::ListEvents(_) => json!({
                "items": [{
                    "id": "weekly",
                    "summary": "Weekly sync",
                    "start": { "dateTime": "2025-05-05T14:00:00Z" },
                    "end": { "dateTime": "2025-05-05T15:00:00Z" }
                }]
            }),
            CalendarOperation::CreateEvent { event, .. } => json!({
                "id": "created-1",
                "summary": event.summary,
                "start": { "dateTime": event.start },
                "end": { "dateTime": event.end },
                "htmlLink": "https://calendar.example/created-1"
            }),
            CalendarOperation::DeleteEvent { .. } => Value::Null,
            _ => json!({ "kind": "calendar#stub" }),
        })
    }
}

pub struct TestApp {
    pub state: AppState,
    pub calendar: Arc<FakeCalendar>,
    pub tokens: Arc<FakeTokenEndpoint>,
}

pub fn test_config() -> Config {
    Config {
        client_id: "client-123".into(),
        client_secret: "shh".into(),
        default_window_year: 2025,
        ..Config::default()
    }
}

pub fn build(config: Config, calendar: FakeCalendar, refresh_token: Option<&str>) -> TestApp {
    let tokens = Arc::new(FakeTokenEndpoint::default());
    let calendar = Arc::new(calendar);
    let credentials = Arc::new(CredentialStore::new(
        tokens.clone(),
        None,
        refresh_token.map(str::to_string),
    ));
    let state = AppState::from_parts(config, credentials, calendar.clone());
    state.mark_ready();
    TestApp { state, calendar, tokens }
}

pub fn authorized(calendar: FakeCalendar) -> TestApp {
    build(test_config(), calendar, Some("seed-refresh"))
}

pub fn router(app: &TestApp) -> axum::Router {
    calendar_gateway::create_router(app.state.clone())
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_text(response: Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub fn assert_error_envelope(status: StatusCode, expected: StatusCode, body: &Value) {
    assert_eq!(status, expected, "unexpected status, body: {body}");
    let obj = body.as_object().expect("error body is an object");
    assert_eq!(obj.len(), 1, "error envelope has exactly one key: {body}");
    assert!(obj["error"].as_str().is_some_and(|s| !s.is_empty()));
}
