// Shared stubs for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use crate::calendar::{CalendarOperation, CalendarProvider, UpstreamError};
use crate::dispatch::Dispatcher;
use crate::oauth::{CredentialError, CredentialStore, TokenEndpoint, TokenGrant};
use crate::tools::ToolRegistry;

pub const TEST_WINDOW_YEAR: i32 = 2025;

/// Token endpoint that always grants; counts refreshes.
#[derive(Default)]
pub struct StaticTokenEndpoint {
    pub refreshes: AtomicUsize,
}

#[async_trait::async_trait]
impl TokenEndpoint for StaticTokenEndpoint {
    async fn exchange_code(
        &self,
        code: &str,
        _code_verifier: Option<&str>,
    ) -> Result<TokenGrant, CredentialError> {
        Ok(TokenGrant {
            access_token: format!("access-{code}"),
            refresh_token: Some(format!("refresh-{code}")),
            expires_in: Some(3600),
        })
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, CredentialError> {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TokenGrant {
            access_token: format!("access-{n}"),
            refresh_token: None,
            expires_in: Some(3600),
        })
    }
}

/// Canned Calendar v3 responses; records every operation it receives.
pub struct StubProvider {
    pub calls: AtomicUsize,
    pub ops: Mutex<Vec<CalendarOperation>>,
    fail_with: Option<UpstreamError>,
}

impl StubProvider {
    pub fn new() -> Self {
        Self { calls: AtomicUsize::new(0), ops: Mutex::new(Vec::new()), fail_with: None }
    }

    pub fn failing(err: UpstreamError) -> Self {
        Self { fail_with: Some(err), ..Self::new() }
    }
}

#[async_trait::async_trait]
impl CalendarProvider for StubProvider {
    async fn execute(
        &self,
        op: &CalendarOperation,
        _access_token: &str,
    ) -> Result<Value, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.ops.lock().unwrap().push(op.clone());
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }
        Ok(match op {
            CalendarOperation::ListCalendars => {
                json!({ "items": [{ "id": "primary", "summary": "Me" }] })
            }
            CalendarOperation::GetCalendar { calendar_id } => {
                json!({ "id": calendar_id, "summary": "Team" })
            }
            CalendarOperation::ListEvents(_) => json!({
                "items": [
                    {
                        "id": "e1",
                        "summary": "Standup",
                        "start": { "dateTime": "2025-03-01T09:00:00Z" },
                        "end": { "dateTime": "2025-03-01T09:30:00Z" }
                    },
                    {
                        "id": "e2",
                        "summary": "Holiday",
                        "start": { "date": "2025-12-25" },
                        "end": { "date": "2025-12-26" }
                    }
                ]
            }),
            CalendarOperation::GetEvent { event_id, .. } => json!({
                "id": event_id,
                "summary": "Existing",
                "start": { "dateTime": "2025-03-02T10:00:00Z" },
                "end": { "dateTime": "2025-03-02T11:00:00Z" }
            }),
            CalendarOperation::CreateEvent { event, .. } => json!({
                "id": "evt-new",
                "summary": event.summary,
                "start": { "dateTime": event.start },
                "end": { "dateTime": event.end }
            }),
            CalendarOperation::UpdateEvent { event_id, patch, .. } => json!({
                "id": event_id,
                "summary": patch.summary.clone().unwrap_or_else(|| "Existing".into()),
                "start": { "dateTime": patch.start.clone().unwrap_or_else(|| "2025-03-02T10:00:00Z".into()) },
                "end": { "dateTime": patch.end.clone().unwrap_or_else(|| "2025-03-02T11:00:00Z".into()) }
            }),
            CalendarOperation::DeleteEvent { .. } => Value::Null,
            CalendarOperation::ListColors => json!({
                "kind": "calendar#colors",
                "calendar": { "1": { "background": "#ac725e", "foreground": "#1d1d1d" } },
                "event": { "1": { "background": "#a4bdfc", "foreground": "#1d1d1d" } }
            }),
        })
    }
}

pub fn stub_credentials() -> (Arc<CredentialStore>, Arc<StaticTokenEndpoint>) {
    let endpoint = Arc::new(StaticTokenEndpoint::default());
    let store = Arc::new(CredentialStore::new(endpoint.clone(), None, Some("seed".into())));
    (store, endpoint)
}

pub fn stub_dispatcher(
    provider: StubProvider,
) -> (Arc<Dispatcher>, Arc<StubProvider>, Arc<StaticTokenEndpoint>) {
    let provider = Arc::new(provider);
    let (credentials, endpoint) = stub_credentials();
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(ToolRegistry::builtin()),
        credentials,
        provider.clone(),
        TEST_WINDOW_YEAR,
    ));
    (dispatcher, provider, endpoint)
}
