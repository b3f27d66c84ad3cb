// Calendar Gateway: Google OAuth credential lifecycle
//
// One credential per process: a long-lived refresh token (seeded from config,
// minted from an authorization code, or loaded from the credential file) and
// a short-lived access token refreshed on demand. Refreshes are single-flight:
// concurrent callers that find the access token expired wait on one exchange.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::Json;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};

use crate::config::Config;
use crate::state::{AppState, PendingAuthorization};

/// Access tokens are treated as expired this long before the provider says so.
const TOKEN_EXPIRY_BUFFER_SECS: i64 = 300;

// ═══════════════════════════════════════════════════════════════════════
//  Errors
// ═══════════════════════════════════════════════════════════════════════

/// Credential failures. None of these are retried automatically; the
/// operator has to re-run the authorization flow.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CredentialError {
    #[error("not authorized: no refresh token held, complete the authorization flow at /auth")]
    NotAuthorized,

    #[error("token exchange rejected: {0}; re-authorize at /auth")]
    Rejected(String),

    #[error("token endpoint unreachable: {0}")]
    Transport(String),

    #[error("credential storage error: {0}")]
    Storage(String),
}

// ═══════════════════════════════════════════════════════════════════════
//  Token endpoint (dependency injection point)
// ═══════════════════════════════════════════════════════════════════════

/// Result of a code or refresh exchange.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

#[async_trait::async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenGrant, CredentialError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, CredentialError>;
}

pub struct GoogleTokenEndpoint {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    timeout: std::time::Duration,
}

impl GoogleTokenEndpoint {
    pub fn new(client: reqwest::Client, config: &Config) -> Self {
        Self {
            client,
            token_url: config.token_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri(),
            timeout: config.upstream_timeout,
        }
    }

    async fn post_form(&self, form: &[(&str, &str)]) -> Result<TokenGrant, CredentialError> {
        let resp = self
            .client
            .post(&self.token_url)
            .form(form)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| CredentialError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            // Google: {"error": "invalid_grant", "error_description": "Token has been expired or revoked."}
            let reason = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| {
                    let code = v.get("error").and_then(|e| e.as_str())?.to_string();
                    Some(match v.get("error_description").and_then(|d| d.as_str()) {
                        Some(desc) => format!("{code}: {desc}"),
                        None => code,
                    })
                })
                .unwrap_or_else(|| format!("token endpoint returned {status}"));
            tracing::error!(status = status.as_u16(), "Google token exchange failed: {}", reason);
            return Err(CredentialError::Rejected(reason));
        }

        resp.json::<TokenGrant>()
            .await
            .map_err(|e| CredentialError::Rejected(format!("invalid token response: {e}")))
    }
}

#[async_trait::async_trait]
impl TokenEndpoint for GoogleTokenEndpoint {
    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenGrant, CredentialError> {
        let mut form = vec![
            ("code", code),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("grant_type", "authorization_code"),
        ];
        if let Some(verifier) = code_verifier {
            form.push(("code_verifier", verifier));
        }
        self.post_form(&form).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, CredentialError> {
        self.post_form(&[
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ])
        .await
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  AES-256-GCM token encryption
// ═══════════════════════════════════════════════════════════════════════

/// Encrypts the stored refresh token when a key is configured.
/// Format: `enc:<nonce-hex>:<ciphertext-hex>`. Without a key, plaintext.
#[derive(Clone)]
pub struct TokenCipher {
    key: Option<[u8; 32]>,
}

impl TokenCipher {
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            key: secret.filter(|s| !s.is_empty()).map(derive_encryption_key),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CredentialError> {
        let Some(key) = self.key else {
            return Ok(plaintext.to_string());
        };
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CredentialError::Storage(format!("cipher init failed: {e}")))?;
        let nonce_bytes: [u8; 12] = rand::random();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| CredentialError::Storage(format!("encryption failed: {e}")))?;
        Ok(format!("enc:{}:{}", hex::encode(nonce_bytes), hex::encode(ciphertext)))
    }

    pub fn decrypt(&self, stored: &str) -> Result<String, CredentialError> {
        if !stored.starts_with("enc:") {
            return Ok(stored.to_string());
        }
        let Some(key) = self.key else {
            return Err(CredentialError::Storage(
                "credential file is encrypted but no CREDENTIAL_ENCRYPTION_KEY is configured".into(),
            ));
        };
        let parts: Vec<&str> = stored.splitn(3, ':').collect();
        if parts.len() != 3 {
            return Err(CredentialError::Storage("malformed encrypted token".into()));
        }
        let nonce_bytes = hex::decode(parts[1])
            .map_err(|e| CredentialError::Storage(format!("invalid nonce hex: {e}")))?;
        let ciphertext = hex::decode(parts[2])
            .map_err(|e| CredentialError::Storage(format!("invalid ciphertext hex: {e}")))?;
        if nonce_bytes.len() != 12 {
            return Err(CredentialError::Storage(format!(
                "invalid nonce length: {} (expected 12)",
                nonce_bytes.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CredentialError::Storage(format!("cipher init failed: {e}")))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|e| CredentialError::Storage(format!("decryption failed (wrong key?): {e}")))?;
        String::from_utf8(plaintext)
            .map_err(|e| CredentialError::Storage(format!("decrypted token is not UTF-8: {e}")))
    }
}

/// Derive a 32-byte AES-256 key from a secret string via SHA-256.
fn derive_encryption_key(secret: &str) -> [u8; 32] {
    let hash = Sha256::digest(secret.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&hash);
    key
}

// ═══════════════════════════════════════════════════════════════════════
//  Flat-file persistence
// ═══════════════════════════════════════════════════════════════════════

#[derive(Serialize, Deserialize)]
struct StoredCredential {
    refresh_token: String,
    updated_at: DateTime<Utc>,
}

/// Single-record credential file, last write wins.
pub struct CredentialFile {
    path: PathBuf,
    cipher: TokenCipher,
}

impl CredentialFile {
    pub fn new(path: impl Into<PathBuf>, cipher: TokenCipher) -> Self {
        Self { path: path.into(), cipher }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Option<String>, CredentialError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CredentialError::Storage(format!(
                    "read {}: {e}",
                    self.path.display()
                )));
            }
        };
        let stored: StoredCredential = serde_json::from_str(&raw).map_err(|e| {
            CredentialError::Storage(format!("parse {}: {e}", self.path.display()))
        })?;
        let token = self.cipher.decrypt(&stored.refresh_token)?;
        Ok(Some(token).filter(|t| !t.is_empty()))
    }

    /// Write via temp file + rename so a crash never leaves a torn record.
    pub async fn save(&self, refresh_token: &str) -> Result<(), CredentialError> {
        let record = StoredCredential {
            refresh_token: self.cipher.encrypt(refresh_token)?,
            updated_at: Utc::now(),
        };
        let body = serde_json::to_vec_pretty(&record)
            .map_err(|e| CredentialError::Storage(e.to_string()))?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| CredentialError::Storage(format!("create {}: {e}", dir.display())))?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|e| CredentialError::Storage(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| CredentialError::Storage(format!("rename {}: {e}", self.path.display())))?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Credential store
// ═══════════════════════════════════════════════════════════════════════

/// A credential usable for the next provider call.
#[derive(Debug, Clone)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub expiry: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct CredentialStatus {
    pub authorized: bool,
    pub access_token_cached: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Held {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expiry: Option<DateTime<Utc>>,
}

impl Held {
    fn usable(&self, now: DateTime<Utc>) -> Option<Credential> {
        let access_token = self.access_token.clone()?;
        let refresh_token = self.refresh_token.clone()?;
        let fresh = self
            .expiry
            .is_none_or(|exp| now < exp - ChronoDuration::seconds(TOKEN_EXPIRY_BUFFER_SECS));
        fresh.then_some(Credential { access_token, refresh_token, expiry: self.expiry })
    }
}

pub struct CredentialStore {
    held: RwLock<Held>,
    /// Serializes refresh exchanges (single-flight).
    refresh_lock: Mutex<()>,
    endpoint: Arc<dyn TokenEndpoint>,
    storage: Option<CredentialFile>,
}

impl CredentialStore {
    pub fn new(
        endpoint: Arc<dyn TokenEndpoint>,
        storage: Option<CredentialFile>,
        refresh_token: Option<String>,
    ) -> Self {
        Self {
            held: RwLock::new(Held { refresh_token, ..Held::default() }),
            refresh_lock: Mutex::new(()),
            endpoint,
            storage,
        }
    }

    /// Build a store, preferring a persisted refresh token over the seed one.
    pub async fn load(
        endpoint: Arc<dyn TokenEndpoint>,
        storage: CredentialFile,
        seed_refresh_token: Option<String>,
    ) -> Result<Self, CredentialError> {
        let refresh_token = match storage.load().await? {
            Some(token) => {
                tracing::info!("Loaded refresh token from {}", storage.path().display());
                Some(token)
            }
            None => seed_refresh_token,
        };
        if refresh_token.is_none() {
            tracing::warn!("No refresh token available: visit /auth to authorize");
        }
        Ok(Self::new(endpoint, Some(storage), refresh_token))
    }

    /// Return a credential good for the next provider call, refreshing the
    /// access token first if it is missing or about to expire.
    pub async fn get_valid_credential(&self) -> Result<Credential, CredentialError> {
        if let Some(cred) = self.held.read().await.usable(Utc::now()) {
            return Ok(cred);
        }

        let _flight = self.refresh_lock.lock().await;

        // Another caller may have finished the refresh while we waited.
        if let Some(cred) = self.held.read().await.usable(Utc::now()) {
            return Ok(cred);
        }

        let refresh_token = self
            .held
            .read()
            .await
            .refresh_token
            .clone()
            .ok_or(CredentialError::NotAuthorized)?;

        tracing::info!("Refreshing Google OAuth access token");
        let grant = self.endpoint.refresh(&refresh_token).await?;

        let rotated = grant
            .refresh_token
            .clone()
            .filter(|t| !t.is_empty() && *t != refresh_token);
        let expiry = grant
            .expires_in
            .map(|secs| Utc::now() + ChronoDuration::seconds(secs));

        let cred = {
            let mut held = self.held.write().await;
            held.access_token = Some(grant.access_token.clone());
            held.expiry = expiry;
            if let Some(new_refresh) = &rotated {
                held.refresh_token = Some(new_refresh.clone());
            }
            Credential {
                access_token: grant.access_token,
                refresh_token: rotated.clone().unwrap_or(refresh_token),
                expiry,
            }
        };

        if let (Some(new_refresh), Some(storage)) = (&rotated, &self.storage) {
            if let Err(e) = storage.save(new_refresh).await {
                tracing::warn!("Failed to persist rotated refresh token: {}", e);
            }
        }

        tracing::info!("Google OAuth access token refreshed");
        Ok(cred)
    }

    /// Exchange a one-time authorization code for tokens and persist the new
    /// refresh token. Overwrites whatever credential was held before.
    pub async fn record_authorization_code(
        &self,
        code: &str,
        code_verifier: Option<&str>,
    ) -> Result<(), CredentialError> {
        let grant = self.endpoint.exchange_code(code, code_verifier).await?;
        let refresh_token = grant.refresh_token.filter(|t| !t.is_empty()).ok_or_else(|| {
            CredentialError::Rejected(
                "provider returned no refresh token (consent must request offline access)".into(),
            )
        })?;

        // Held across the save so an in-flight refresh cannot persist a
        // rotated token over this one.
        let _flight = self.refresh_lock.lock().await;
        if let Some(storage) = &self.storage {
            storage.save(&refresh_token).await?;
        }

        let mut held = self.held.write().await;
        held.access_token = Some(grant.access_token);
        held.refresh_token = Some(refresh_token);
        held.expiry = grant
            .expires_in
            .map(|secs| Utc::now() + ChronoDuration::seconds(secs));

        tracing::info!("Authorization code exchanged, refresh token stored");
        Ok(())
    }

    /// Drop the cached access token so the next call refreshes.
    /// Used when the provider answers 401 for a token we believed valid.
    /// A no-op if `rejected` has already been replaced by a newer token.
    pub async fn invalidate_access_token(&self, rejected: &str) {
        let mut held = self.held.write().await;
        if held.access_token.as_deref() == Some(rejected) {
            held.access_token = None;
            held.expiry = None;
        }
    }

    pub async fn status(&self) -> CredentialStatus {
        let held = self.held.read().await;
        CredentialStatus {
            authorized: held.refresh_token.is_some(),
            access_token_cached: held.usable(Utc::now()).is_some(),
            expires_at: held.expiry,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Consent URL + PKCE
// ═══════════════════════════════════════════════════════════════════════

/// Provider consent URL for the configured scope, with PKCE and CSRF state.
pub fn authorization_url(
    config: &Config,
    code_challenge: &str,
    oauth_state: &str,
) -> Result<url::Url, url::ParseError> {
    let mut auth_url = url::Url::parse(&config.authorize_url)?;
    auth_url
        .query_pairs_mut()
        .append_pair("client_id", &config.client_id)
        .append_pair("redirect_uri", &config.redirect_uri())
        .append_pair("response_type", "code")
        .append_pair("scope", config.scope.as_scope())
        .append_pair("code_challenge", code_challenge)
        .append_pair("code_challenge_method", "S256")
        .append_pair("state", oauth_state)
        .append_pair("access_type", "offline")
        .append_pair("prompt", "consent");
    Ok(auth_url)
}

fn random_base64url(len: usize) -> String {
    let buf: Vec<u8> = (0..len).map(|_| rand::random::<u8>()).collect();
    URL_SAFE_NO_PAD.encode(&buf)
}

fn sha256_base64url(input: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(input.as_bytes()))
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn page(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html><html><head><title>{title}</title></head>
        <body style="font-family:monospace;display:flex;align-items:center;justify-content:center;height:100vh;margin:0">
        <div style="text-align:center"><h2>{title}</h2><p>{body}</p></div>
        </body></html>"#
    )
}

fn error_page(status: StatusCode, title: &str, detail: &str) -> Response {
    (status, Html(page(title, &html_escape(detail)))).into_response()
}

// ═══════════════════════════════════════════════════════════════════════
//  Handlers
// ═══════════════════════════════════════════════════════════════════════

/// GET /auth: redirect the browser to the provider's consent screen.
pub async fn auth_redirect(State(state): State<AppState>) -> Response {
    let code_verifier = random_base64url(32);
    let code_challenge = sha256_base64url(&code_verifier);
    let oauth_state = random_base64url(32);

    let url = match authorization_url(&state.config, &code_challenge, &oauth_state) {
        Ok(url) => url,
        Err(e) => {
            tracing::error!("Invalid authorize URL in configuration: {}", e);
            return error_page(StatusCode::INTERNAL_SERVER_ERROR, "Configuration Error", &e.to_string());
        }
    };

    *state.oauth_pending.write().await = Some(PendingAuthorization {
        code_verifier,
        state: oauth_state,
    });

    tracing::info!(scope = state.config.scope.as_scope(), "Redirecting to Google consent screen");
    Redirect::temporary(url.as_str()).into_response()
}

/// Query params from the provider's redirect back to us.
#[derive(Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// GET /auth/callback: exchange the code and store the refresh token.
pub async fn auth_callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Response {
    if let Some(error) = params.error {
        tracing::warn!("Authorization denied by provider: {}", error);
        return error_page(StatusCode::BAD_REQUEST, "Authorization Failed", &error);
    }

    let (Some(code), Some(oauth_state)) = (params.code, params.state) else {
        return error_page(
            StatusCode::BAD_REQUEST,
            "Missing Parameters",
            "No authorization code received.",
        );
    };

    let code_verifier = {
        let mut pending = state.oauth_pending.write().await;
        match pending.take() {
            Some(p) if p.state == oauth_state => p.code_verifier,
            other => {
                // Keep an unrelated in-flight authorization alive.
                *pending = other;
                tracing::warn!("OAuth callback with unknown state");
                return error_page(
                    StatusCode::BAD_REQUEST,
                    "Invalid State",
                    "OAuth state mismatch. Please start again at /auth.",
                );
            }
        }
    };

    match state
        .credentials
        .record_authorization_code(&code, Some(&code_verifier))
        .await
    {
        Ok(()) => (
            StatusCode::OK,
            Html(page(
                "Authorization Complete",
                "Calendar access granted. You can close this window.",
            )),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Authorization code exchange failed: {}", e);
            error_page(StatusCode::BAD_GATEWAY, "Token Exchange Failed", &e.to_string())
        }
    }
}

/// GET /api/auth/status
#[utoipa::path(get, path = "/api/auth/status", tag = "auth",
    responses((status = 200, description = "Credential state", body = CredentialStatus))
)]
pub async fn auth_status(State(state): State<AppState>) -> Json<CredentialStatus> {
    Json(state.credentials.status().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Counts exchanges; refresh sleeps so concurrent callers overlap.
    struct CountingEndpoint {
        refreshes: AtomicUsize,
        codes: AtomicUsize,
        reject: bool,
        rotate_to: Option<String>,
    }

    impl CountingEndpoint {
        fn new() -> Self {
            Self { refreshes: AtomicUsize::new(0), codes: AtomicUsize::new(0), reject: false, rotate_to: None }
        }
    }

    #[async_trait::async_trait]
    impl TokenEndpoint for CountingEndpoint {
        async fn exchange_code(
            &self,
            code: &str,
            _code_verifier: Option<&str>,
        ) -> Result<TokenGrant, CredentialError> {
            self.codes.fetch_add(1, Ordering::SeqCst);
            Ok(TokenGrant {
                access_token: format!("access-for-{code}"),
                refresh_token: Some(format!("refresh-for-{code}")),
                expires_in: Some(3600),
            })
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, CredentialError> {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.reject {
                return Err(CredentialError::Rejected("invalid_grant: Token has been expired or revoked.".into()));
            }
            Ok(TokenGrant {
                access_token: format!("access-{n}"),
                refresh_token: self.rotate_to.clone(),
                expires_in: Some(3600),
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_refresh() {
        let endpoint = Arc::new(CountingEndpoint::new());
        let store = Arc::new(CredentialStore::new(endpoint.clone(), None, Some("seed".into())));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.get_valid_credential().await })
            })
            .collect();

        for h in handles {
            let cred = h.await.unwrap().unwrap();
            assert_eq!(cred.access_token, "access-1");
        }
        assert_eq!(endpoint.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fresh_token_is_reused_without_exchange() {
        let endpoint = Arc::new(CountingEndpoint::new());
        let store = CredentialStore::new(endpoint.clone(), None, Some("seed".into()));
        store.get_valid_credential().await.unwrap();
        store.get_valid_credential().await.unwrap();
        assert_eq!(endpoint.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidated_token_triggers_new_refresh() {
        let endpoint = Arc::new(CountingEndpoint::new());
        let store = CredentialStore::new(endpoint.clone(), None, Some("seed".into()));
        let first = store.get_valid_credential().await.unwrap();
        store.invalidate_access_token(&first.access_token).await;
        let cred = store.get_valid_credential().await.unwrap();
        assert_eq!(cred.access_token, "access-2");
    }

    #[tokio::test]
    async fn stale_rejection_keeps_newer_access_token() {
        let endpoint = Arc::new(CountingEndpoint::new());
        let store = CredentialStore::new(endpoint.clone(), None, Some("seed".into()));
        let first = store.get_valid_credential().await.unwrap();
        store.invalidate_access_token(&first.access_token).await;
        let second = store.get_valid_credential().await.unwrap();

        // A late 401 for the first token must not evict the second.
        store.invalidate_access_token(&first.access_token).await;
        let cred = store.get_valid_credential().await.unwrap();
        assert_eq!(cred.access_token, second.access_token);
        assert_eq!(endpoint.refreshes.load(Ordering::SeqCst), 2);
    }

    /// Refresh parks until released, then rotates the refresh token.
    struct GatedEndpoint {
        started: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl TokenEndpoint for GatedEndpoint {
        async fn exchange_code(
            &self,
            code: &str,
            _code_verifier: Option<&str>,
        ) -> Result<TokenGrant, CredentialError> {
            Ok(TokenGrant {
                access_token: format!("access-for-{code}"),
                refresh_token: Some(format!("refresh-for-{code}")),
                expires_in: Some(3600),
            })
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, CredentialError> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(TokenGrant {
                access_token: "access-rotated".into(),
                refresh_token: Some("rotated-old".into()),
                expires_in: Some(3600),
            })
        }
    }

    #[tokio::test]
    async fn authorization_during_refresh_leaves_file_matching_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let endpoint = Arc::new(GatedEndpoint {
            started: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });
        let store = Arc::new(CredentialStore::new(
            endpoint.clone(),
            Some(CredentialFile::new(&path, TokenCipher::new(None))),
            Some("seed".into()),
        ));

        let refreshing = {
            let store = store.clone();
            tokio::spawn(async move { store.get_valid_credential().await })
        };
        endpoint.started.notified().await;

        let authorizing = {
            let store = store.clone();
            tokio::spawn(async move { store.record_authorization_code("new", None).await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        endpoint.release.notify_one();

        refreshing.await.unwrap().unwrap();
        authorizing.await.unwrap().unwrap();

        let in_memory = store.get_valid_credential().await.unwrap().refresh_token;
        let on_disk = CredentialFile::new(&path, TokenCipher::new(None)).load().await.unwrap();
        assert_eq!(in_memory, "refresh-for-new");
        assert_eq!(on_disk.as_deref(), Some("refresh-for-new"));
    }

    #[tokio::test]
    async fn missing_refresh_token_is_not_authorized() {
        let endpoint = Arc::new(CountingEndpoint::new());
        let store = CredentialStore::new(endpoint.clone(), None, None);
        let err = store.get_valid_credential().await.unwrap_err();
        assert!(matches!(err, CredentialError::NotAuthorized));
        assert_eq!(endpoint.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn revoked_refresh_token_surfaces_rejection() {
        let endpoint = Arc::new(CountingEndpoint { reject: true, ..CountingEndpoint::new() });
        let store = CredentialStore::new(endpoint, None, Some("revoked".into()));
        let err = store.get_valid_credential().await.unwrap_err();
        assert!(matches!(err, CredentialError::Rejected(_)));
        assert!(err.to_string().contains("re-authorize"));
    }

    #[tokio::test]
    async fn authorization_code_is_persisted_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds/credentials.json");
        let endpoint = Arc::new(CountingEndpoint::new());

        let store = CredentialStore::new(
            endpoint.clone(),
            Some(CredentialFile::new(&path, TokenCipher::new(Some("k")))),
            None,
        );
        store.record_authorization_code("abc", None).await.unwrap();
        assert!(store.status().await.authorized);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("enc:"));
        assert!(!raw.contains("refresh-for-abc"));

        let reloaded = CredentialStore::load(
            endpoint,
            CredentialFile::new(&path, TokenCipher::new(Some("k"))),
            Some("seed".into()),
        )
        .await
        .unwrap();
        let cred = reloaded.get_valid_credential().await.unwrap();
        assert_eq!(cred.refresh_token, "refresh-for-abc");
    }

    #[tokio::test]
    async fn rotated_refresh_token_replaces_held_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let endpoint = Arc::new(CountingEndpoint { rotate_to: Some("rotated".into()), ..CountingEndpoint::new() });
        let store = CredentialStore::new(
            endpoint,
            Some(CredentialFile::new(&path, TokenCipher::new(None))),
            Some("seed".into()),
        );
        let cred = store.get_valid_credential().await.unwrap();
        assert_eq!(cred.refresh_token, "rotated");

        let stored = CredentialFile::new(&path, TokenCipher::new(None)).load().await.unwrap();
        assert_eq!(stored.as_deref(), Some("rotated"));
    }

    #[tokio::test]
    async fn encrypted_file_without_key_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        CredentialFile::new(&path, TokenCipher::new(Some("k"))).save("secret").await.unwrap();

        let err = CredentialFile::new(&path, TokenCipher::new(None)).load().await.unwrap_err();
        assert!(matches!(err, CredentialError::Storage(_)));
    }

    #[test]
    fn consent_url_requests_offline_access_for_configured_scope() {
        let config = Config {
            client_id: "client-1".into(),
            scope: crate::config::AccessScope::ReadOnly,
            ..Config::default()
        };
        let url = authorization_url(&config, "challenge", "xyz").unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("access_type".into(), "offline".into())));
        assert!(pairs.contains(&(
            "scope".into(),
            "https://www.googleapis.com/auth/calendar.readonly".into()
        )));
        assert!(pairs.contains(&("state".into(), "xyz".into())));
    }
}
