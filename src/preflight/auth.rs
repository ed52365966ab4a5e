//! Access-token resolution for the remote store.
//!
//! Resolution order: explicit token (config or `INGESTOPS_ACCESS_TOKEN`),
//! cached token that has not expired, OAuth refresh-token grant. A refreshed
//! token is cached to disk.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::artifacts;
use crate::config::OpsConfig;
use crate::error::ErrorCategory;

/// Tokens this close to expiry are treated as expired.
const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("no access token: set auth.access_token or refresh credentials")]
    NoCredentials,

    #[error("token endpoint unreachable: {0}")]
    Connection(String),

    #[error("token refresh rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("token response parse error: {0}")]
    ResponseParsing(String),
}

impl AuthError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection(_) => ErrorCategory::Network,
            _ => ErrorCategory::Auth,
        }
    }
}

/// Source of bearer tokens (allows mocking for tests).
pub trait TokenSource: Send + Sync {
    fn access_token(&self) -> Result<String, AuthError>;

    /// Last token handed out, for log redaction. Never triggers a refresh.
    fn cached_token(&self) -> Option<String> {
        None
    }

    /// Drop any cached token after the remote rejected it.
    fn invalidate(&self) {}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - chrono::Duration::seconds(EXPIRY_SKEW_SECS) > now
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

pub struct DefaultTokenSource {
    explicit: Option<String>,
    refresh_token: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    token_endpoint: String,
    cache_path: PathBuf,
    timeout: Duration,
    cached: Mutex<Option<CachedToken>>,
}

impl DefaultTokenSource {
    pub fn from_config(config: &OpsConfig) -> Self {
        Self {
            explicit: config.auth.access_token.clone().filter(|t| !t.is_empty()),
            refresh_token: config.auth.refresh_token.clone().filter(|t| !t.is_empty()),
            client_id: config.auth.client_id.clone(),
            client_secret: config.auth.client_secret.clone(),
            token_endpoint: config.auth.token_endpoint.clone(),
            cache_path: config.token_cache_path(),
            timeout: Duration::from_secs(config.sync.request_timeout_secs),
            cached: Mutex::new(None),
        }
    }

    fn load_cache_file(&self) -> Option<CachedToken> {
        artifacts::read_json_opt::<CachedToken>(&self.cache_path)
    }

    fn refresh(&self, refresh_token: &str) -> Result<CachedToken, AuthError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| AuthError::Connection(e.to_string()))?;

        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        if let Some(id) = &self.client_id {
            form.push(("client_id", id.as_str()));
        }
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let response = client
            .post(&self.token_endpoint)
            .form(&form)
            .send()
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    AuthError::Connection(self.token_endpoint.clone())
                } else {
                    AuthError::Connection(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TokenResponse = response
            .json()
            .map_err(|e| AuthError::ResponseParsing(e.to_string()))?;

        Ok(CachedToken {
            access_token: parsed.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(parsed.expires_in.unwrap_or(3600)),
        })
    }
}

impl TokenSource for DefaultTokenSource {
    fn access_token(&self) -> Result<String, AuthError> {
        if let Some(token) = &self.explicit {
            return Ok(token.clone());
        }

        let now = Utc::now();
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh(now)) {
            return Ok(token.access_token.clone());
        }
        if let Some(token) = self.load_cache_file().filter(|t| t.is_fresh(now)) {
            let access = token.access_token.clone();
            *cached = Some(token);
            return Ok(access);
        }

        let refresh_token = self.refresh_token.as_deref().ok_or(AuthError::NoCredentials)?;
        let token = self.refresh(refresh_token)?;
        if let Err(e) = artifacts::write_json_atomic(&self.cache_path, &token) {
            tracing::warn!(path = %self.cache_path.display(), error = %e, "Failed to cache token");
        }
        tracing::info!(expires_at = %token.expires_at, "Access token refreshed");
        let access = token.access_token.clone();
        *cached = Some(token);
        Ok(access)
    }

    fn cached_token(&self) -> Option<String> {
        if let Some(token) = &self.explicit {
            return Some(token.clone());
        }
        self.cached
            .lock()
            .ok()
            .and_then(|c| c.as_ref().map(|t| t.access_token.clone()))
    }

    fn invalidate(&self) {
        if let Ok(mut cached) = self.cached.lock() {
            *cached = None;
        }
        let _ = std::fs::remove_file(&self.cache_path);
    }
}

/// Fixed token, or none at all.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenSource(pub Option<String>);

impl StaticTokenSource {
    pub fn new(token: &str) -> Self {
        Self(Some(token.to_string()))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

impl TokenSource for StaticTokenSource {
    fn access_token(&self) -> Result<String, AuthError> {
        self.0.clone().ok_or(AuthError::NoCredentials)
    }

    fn cached_token(&self) -> Option<String> {
        self.0.clone()
    }
}
