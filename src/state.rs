// Calendar Gateway: application state

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use reqwest::Client;
use tokio::sync::RwLock;

use crate::calendar::{CalendarProvider, GoogleCalendarClient};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::oauth::{CredentialFile, CredentialStore, GoogleTokenEndpoint, TokenCipher, TokenEndpoint};
use crate::streaming::StreamSessionManager;
use crate::tools::ToolRegistry;

/// PKCE verifier + CSRF state for an in-progress authorization redirect.
pub struct PendingAuthorization {
    pub code_verifier: String,
    pub state: String,
}

/// Central application state. Clone-friendly: everything shared sits behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ToolRegistry>,
    pub credentials: Arc<CredentialStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub sessions: StreamSessionManager,
    pub oauth_pending: Arc<RwLock<Option<PendingAuthorization>>>,
    pub start_time: Instant,
    /// `true` once startup has finished loading credentials.
    pub ready: Arc<AtomicBool>,
}

impl AppState {
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
        tracing::info!("Gateway marked as READY");
    }
}

impl AppState {
    /// Production wiring: Google token endpoint, credential file, Calendar v3 client.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .timeout(config.upstream_timeout)
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()?;

        let endpoint: Arc<dyn TokenEndpoint> = Arc::new(GoogleTokenEndpoint::new(client.clone(), &config));
        let storage = CredentialFile::new(
            config.credential_file.clone(),
            TokenCipher::new(config.encryption_key.as_deref()),
        );
        let credentials =
            CredentialStore::load(endpoint, storage, config.seed_refresh_token.clone()).await?;

        let provider: Arc<dyn CalendarProvider> = Arc::new(GoogleCalendarClient::new(
            client,
            &config.calendar_api,
            config.upstream_timeout,
        )?);

        Ok(Self::from_parts(config, Arc::new(credentials), provider))
    }

    /// Assemble state from already-built collaborators.
    pub fn from_parts(
        config: Config,
        credentials: Arc<CredentialStore>,
        provider: Arc<dyn CalendarProvider>,
    ) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(ToolRegistry::builtin());
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            credentials.clone(),
            provider,
            config.default_window_year,
        ));
        let sessions = StreamSessionManager::new(dispatcher.clone(), config.heartbeat_interval);

        tracing::info!(
            "AppState initialised: {} tools, heartbeat every {}s, scope {}",
            registry.len(),
            config.heartbeat_interval.as_secs(),
            config.scope.as_scope()
        );

        Self {
            config,
            registry,
            credentials,
            dispatcher,
            sessions,
            oauth_pending: Arc::new(RwLock::new(None)),
            start_time: Instant::now(),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }
}
