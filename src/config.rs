// Calendar Gateway: runtime configuration
//
// Read once at startup from the environment (`.env` loaded first) and shared
// by `Arc` with every component that needs it.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Datelike;

const DEFAULT_PORT: u16 = 3001;
const DEFAULT_HEARTBEAT_SECS: u64 = 15;
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CREDENTIAL_FILE: &str = "data/credentials.json";

pub const GOOGLE_AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const GOOGLE_CALENDAR_API: &str = "https://www.googleapis.com/calendar/v3";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {key}")]
    MissingEnv { key: &'static str },

    #[error("invalid value for {key}: {msg}")]
    Invalid { key: &'static str, msg: String },
}

/// OAuth scope requested on the consent screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessScope {
    ReadOnly,
    ReadWrite,
}

impl AccessScope {
    pub fn as_scope(&self) -> &'static str {
        match self {
            AccessScope::ReadOnly => "https://www.googleapis.com/auth/calendar.readonly",
            AccessScope::ReadWrite => "https://www.googleapis.com/auth/calendar",
        }
    }

    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "readonly" | "read-only" | "ro" => Ok(AccessScope::ReadOnly),
            "readwrite" | "read-write" | "rw" => Ok(AccessScope::ReadWrite),
            other => Err(ConfigError::Invalid {
                key: "CALENDAR_SCOPE",
                msg: format!("expected 'readonly' or 'readwrite', got '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // HTTP
    pub base_url: String,
    pub port: u16,

    // Provider OAuth client
    pub client_id: String,
    pub client_secret: String,
    pub seed_refresh_token: Option<String>,
    pub scope: AccessScope,
    pub authorize_url: String,
    pub token_url: String,
    pub calendar_api: String,

    // Credential persistence
    pub credential_file: PathBuf,
    pub encryption_key: Option<String>,

    // Runtime
    pub heartbeat_interval: Duration,
    pub upstream_timeout: Duration,
    pub default_window_year: i32,

    /// None = dev mode, tool and stream routes are open.
    pub auth_secret: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: format!("http://localhost:{DEFAULT_PORT}"),
            port: DEFAULT_PORT,
            client_id: String::new(),
            client_secret: String::new(),
            seed_refresh_token: None,
            scope: AccessScope::ReadWrite,
            authorize_url: GOOGLE_AUTHORIZE_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            calendar_api: GOOGLE_CALENDAR_API.to_string(),
            credential_file: PathBuf::from(DEFAULT_CREDENTIAL_FILE),
            encryption_key: None,
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            upstream_timeout: Duration::from_secs(DEFAULT_UPSTREAM_TIMEOUT_SECS),
            default_window_year: chrono::Utc::now().year(),
            auth_secret: None,
        }
    }
}

impl Config {
    /// Build from the process environment. `main` loads `.env` first.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let port = match env_nonempty("PORT") {
            Some(raw) => raw.parse::<u16>().map_err(|e| ConfigError::Invalid {
                key: "PORT",
                msg: e.to_string(),
            })?,
            None => defaults.port,
        };

        let base_url = env_nonempty("BASE_URL")
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("http://localhost:{port}"));
        url::Url::parse(&base_url).map_err(|e| ConfigError::Invalid {
            key: "BASE_URL",
            msg: e.to_string(),
        })?;

        let client_id = env_nonempty("GOOGLE_CLIENT_ID")
            .ok_or(ConfigError::MissingEnv { key: "GOOGLE_CLIENT_ID" })?;
        let client_secret = env_nonempty("GOOGLE_CLIENT_SECRET")
            .ok_or(ConfigError::MissingEnv { key: "GOOGLE_CLIENT_SECRET" })?;

        let scope = match env_nonempty("CALENDAR_SCOPE") {
            Some(raw) => AccessScope::parse(&raw)?,
            None => defaults.scope,
        };

        let default_window_year = match env_nonempty("DEFAULT_WINDOW_YEAR") {
            Some(raw) => raw.parse::<i32>().map_err(|e| ConfigError::Invalid {
                key: "DEFAULT_WINDOW_YEAR",
                msg: e.to_string(),
            })?,
            None => defaults.default_window_year,
        };

        Ok(Self {
            base_url,
            port,
            client_id,
            client_secret,
            seed_refresh_token: env_nonempty("GOOGLE_REFRESH_TOKEN"),
            scope,
            credential_file: env_nonempty("CREDENTIAL_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.credential_file),
            encryption_key: env_nonempty("CREDENTIAL_ENCRYPTION_KEY"),
            heartbeat_interval: env_secs("HEARTBEAT_INTERVAL_SECS", DEFAULT_HEARTBEAT_SECS)?,
            upstream_timeout: env_secs("UPSTREAM_TIMEOUT_SECS", DEFAULT_UPSTREAM_TIMEOUT_SECS)?,
            default_window_year,
            auth_secret: env_nonempty("AUTH_SECRET"),
            ..defaults
        })
    }

    /// Where the provider sends the browser back after consent.
    pub fn redirect_uri(&self) -> String {
        format!("{}/auth/callback", self.base_url)
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_secs(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let Some(raw) = env_nonempty(key) else {
        return Ok(Duration::from_secs(default));
    };
    let secs = raw.parse::<u64>().map_err(|e| ConfigError::Invalid {
        key,
        msg: e.to_string(),
    })?;
    if secs == 0 {
        return Err(ConfigError::Invalid {
            key,
            msg: "must be greater than zero".into(),
        });
    }
    Ok(Duration::from_secs(secs))
}
