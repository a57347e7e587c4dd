//! HTTP binding of the backend contract.
//!
//! DESIGN
//! ======
//! Thin reqwest wrapper over the hosted platform's REST surfaces:
//! `/auth/v1` for sessions, `/storage/v1` for objects, `/rest/v1` for rows.
//! Response decoding lives in pure `parse_*` functions for testability.
//!
//! The current session is held in memory and, when a session file is
//! configured, mirrored to disk so separate CLI runs stay signed in. Every
//! change to it is broadcast as an `AuthEvent`.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, warn};

use super::{AuthApi, BackendError, Query, StorageApi, TableApi, public_object_url};
use crate::config::BackendConfig;
use crate::models::{AuthEvent, AuthEventKind, Session, SignUpData, User};

const EVENT_CHANNEL_CAPACITY: usize = 16;
const SINGLE_ROW_ACCEPT: &str = "application/vnd.pgrst.object+json";

// =============================================================================
// CLIENT
// =============================================================================

pub struct HttpBackend {
    http: reqwest::Client,
    config: BackendConfig,
    session: RwLock<Option<Session>>,
    events: broadcast::Sender<AuthEvent>,
}

impl HttpBackend {
    /// # Errors
    ///
    /// Returns `HttpClientBuild` if the reqwest client cannot be constructed.
    pub fn new(config: BackendConfig) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeouts.request_secs))
            .connect_timeout(Duration::from_secs(config.timeouts.connect_secs))
            .build()
            .map_err(|e| BackendError::HttpClientBuild(e.to_string()))?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self { http, config, session: RwLock::new(None), events })
    }

    #[must_use]
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Load a previously persisted session, if a session file is configured
    /// and present. Does not emit an event: nothing changed from the user's
    /// point of view.
    ///
    /// # Errors
    ///
    /// Returns `SessionStore` on unreadable files and `Parse` on corrupt ones.
    pub async fn restore_session(&self) -> Result<Option<Session>, BackendError> {
        let Some(path) = &self.config.session_file else {
            return Ok(None);
        };
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let session: Session = serde_json::from_str(&text).map_err(|e| BackendError::Parse(e.to_string()))?;
        debug!(user_id = %session.user.id, "restored session");
        *self.session.write().await = Some(session.clone());
        Ok(Some(session))
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{path}", self.config.url)
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.config.url)
    }

    /// Bearer credential: the session's access token, else the anon key.
    /// An expired session is refreshed first, or dropped if that fails.
    async fn bearer(&self) -> Result<String, BackendError> {
        let token = self.get_session().await?.map(|s| s.access_token);
        Ok(format!("Bearer {}", token.unwrap_or_else(|| self.config.anon_key.clone())))
    }

    async fn set_session(&self, session: Option<Session>, kind: AuthEventKind) -> Result<(), BackendError> {
        *self.session.write().await = session.clone();
        if let Some(path) = &self.config.session_file {
            persist_session(path, session.as_ref()).await?;
        }
        // No receivers is fine; nobody is listening yet.
        let _ = self.events.send(AuthEvent { kind, session });
        Ok(())
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session, BackendError> {
        let response = self
            .http
            .post(self.auth_url("token"))
            .query(&[("grant_type", "refresh_token")])
            .header("apikey", &self.config.anon_key)
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;
        let text = read_success_body(response).await?;
        parse_session(&text, now_unix())
    }
}

// =============================================================================
// AUTH
// =============================================================================

#[async_trait::async_trait]
impl AuthApi for HttpBackend {
    async fn get_session(&self) -> Result<Option<Session>, BackendError> {
        let current = self.session.read().await.clone();
        let Some(session) = current else {
            return Ok(None);
        };
        if !session.is_expired() {
            return Ok(Some(session));
        }

        match self.refresh(&session.refresh_token).await {
            Ok(fresh) => {
                self.set_session(Some(fresh.clone()), AuthEventKind::TokenRefreshed).await?;
                Ok(Some(fresh))
            }
            Err(e) => {
                warn!(error = %e, "session refresh failed; signing out locally");
                self.set_session(None, AuthEventKind::SignedOut).await?;
                Ok(None)
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<SignUpData, BackendError> {
        let response = self
            .http
            .post(self.auth_url("signup"))
            .header("apikey", &self.config.anon_key)
            .json(&serde_json::json!({ "email": email, "password": password, "data": metadata }))
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;
        let text = read_success_body(response).await?;
        let data = parse_sign_up(&text, now_unix())?;
        if let Some(session) = &data.session {
            self.set_session(Some(session.clone()), AuthEventKind::SignedIn).await?;
        }
        Ok(data)
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, BackendError> {
        let response = self
            .http
            .post(self.auth_url("token"))
            .query(&[("grant_type", "password")])
            .header("apikey", &self.config.anon_key)
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;
        let text = read_success_body(response).await?;
        let session = parse_session(&text, now_unix())?;
        self.set_session(Some(session.clone()), AuthEventKind::SignedIn).await?;
        Ok(session)
    }

    async fn sign_in_with_otp(&self, email: &str, redirect_to: &str) -> Result<(), BackendError> {
        let response = self
            .http
            .post(self.auth_url("otp"))
            .query(&[("redirect_to", redirect_to)])
            .header("apikey", &self.config.anon_key)
            .json(&serde_json::json!({ "email": email, "create_user": true }))
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;
        read_success_body(response).await?;
        Ok(())
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        // A session whose refresh fails is already signed out locally.
        if self.get_session().await?.is_none() {
            return Ok(());
        }
        let remote = self
            .http
            .post(self.auth_url("logout"))
            .header("apikey", &self.config.anon_key)
            .header("Authorization", self.bearer().await?)
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()));

        // The local session goes away even when the remote revoke fails.
        self.set_session(None, AuthEventKind::SignedOut).await?;
        read_success_body(remote?).await?;
        Ok(())
    }

    async fn get_user(&self) -> Result<Option<User>, BackendError> {
        let Some(session) = self.get_session().await? else {
            return Ok(None);
        };
        let response = self
            .http
            .get(self.auth_url("user"))
            .header("apikey", &self.config.anon_key)
            .header("Authorization", format!("Bearer {}", session.access_token))
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;
        let text = read_success_body(response).await?;
        let user = serde_json::from_str(&text).map_err(|e| BackendError::Parse(e.to_string()))?;
        Ok(Some(user))
    }
}

// =============================================================================
// STORAGE
// =============================================================================

#[async_trait::async_trait]
impl StorageApi for HttpBackend {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, BackendError> {
        let url = format!("{}/storage/v1/object/{bucket}/{path}", self.config.url);
        let response = self
            .http
            .post(url)
            .header("apikey", &self.config.anon_key)
            .header("Authorization", self.bearer().await?)
            .header("Content-Type", content_type)
            .header("x-upsert", "false")
            .body(bytes)
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;
        read_success_body(response).await?;
        Ok(path.to_string())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        public_object_url(&self.config.url, bucket, path)
    }
}

// =============================================================================
// TABLES
// =============================================================================

#[async_trait::async_trait]
impl TableApi for HttpBackend {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<serde_json::Value>, BackendError> {
        let response = self
            .http
            .get(self.rest_url(table))
            .query(&query.to_params())
            .header("apikey", &self.config.anon_key)
            .header("Authorization", self.bearer().await?)
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;
        let text = read_success_body(response).await?;
        parse_rows(&text)
    }

    async fn select_single(&self, table: &str, query: &Query) -> Result<serde_json::Value, BackendError> {
        let response = self
            .http
            .get(self.rest_url(table))
            .query(&query.to_params())
            .header("apikey", &self.config.anon_key)
            .header("Authorization", self.bearer().await?)
            .header("Accept", SINGLE_ROW_ACCEPT)
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;
        // PostgREST answers 406 when the row count is not exactly one.
        if response.status().as_u16() == 406 {
            return Err(BackendError::NotSingle);
        }
        let text = read_success_body(response).await?;
        serde_json::from_str(&text).map_err(|e| BackendError::Parse(e.to_string()))
    }

    async fn insert(&self, table: &str, rows: Vec<serde_json::Value>) -> Result<Vec<serde_json::Value>, BackendError> {
        let response = self
            .http
            .post(self.rest_url(table))
            .header("apikey", &self.config.anon_key)
            .header("Authorization", self.bearer().await?)
            .header("Prefer", "return=representation")
            .json(&rows)
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;
        let text = read_success_body(response).await?;
        parse_rows(&text)
    }
}

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: User,
}

#[derive(Deserialize)]
struct WrappedUser {
    user: User,
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Decode a token grant into a session, anchoring relative expiry at `now`.
pub(crate) fn parse_session(body: &str, now: i64) -> Result<Session, BackendError> {
    let token: TokenResponse = serde_json::from_str(body).map_err(|e| BackendError::Parse(e.to_string()))?;
    let expires_at = token
        .expires_at
        .or_else(|| token.expires_in.map(|secs| now + secs))
        .unwrap_or(now);
    Ok(Session { access_token: token.access_token, refresh_token: token.refresh_token, expires_at, user: token.user })
}

/// Sign-up answers with a full token grant when confirmation is disabled,
/// otherwise with the bare (or wrapped) user.
pub(crate) fn parse_sign_up(body: &str, now: i64) -> Result<SignUpData, BackendError> {
    if let Ok(session) = parse_session(body, now) {
        return Ok(SignUpData { user: session.user.clone(), session: Some(session) });
    }
    if let Ok(wrapped) = serde_json::from_str::<WrappedUser>(body) {
        return Ok(SignUpData { user: wrapped.user, session: None });
    }
    let user: User = serde_json::from_str(body).map_err(|e| BackendError::Parse(e.to_string()))?;
    Ok(SignUpData { user, session: None })
}

pub(crate) fn parse_rows(body: &str) -> Result<Vec<serde_json::Value>, BackendError> {
    serde_json::from_str(body).map_err(|e| BackendError::Parse(e.to_string()))
}

/// Human-readable message from an error body. The three services disagree
/// on the field name, so try each before falling back to the raw text.
pub(crate) fn error_message(body: &str, status: u16) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["msg", "message", "error_description", "error"] {
            if let Some(msg) = value.get(key).and_then(serde_json::Value::as_str) {
                return msg.to_string();
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() { format!("HTTP {status}") } else { trimmed.to_string() }
}

async fn read_success_body(response: reqwest::Response) -> Result<String, BackendError> {
    let status = response.status().as_u16();
    let text = response
        .text()
        .await
        .map_err(|e| BackendError::Request(e.to_string()))?;
    if !(200..300).contains(&status) {
        return Err(BackendError::Response { status, message: error_message(&text, status) });
    }
    Ok(text)
}

async fn persist_session(path: &Path, session: Option<&Session>) -> Result<(), BackendError> {
    match session {
        Some(session) => {
            let json = serde_json::to_string_pretty(session).map_err(|e| BackendError::Parse(e.to_string()))?;
            write_private(path, json.as_bytes()).await?;
        }
        None => match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        },
    }
    Ok(())
}

/// Write `bytes` to `path` readable by the owner only. The mode is
/// tightened before any bytes land, including on an existing file.
async fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600)).await?;
    }
    file.write_all(bytes).await?;
    file.flush().await
}

#[cfg(test)]
#[path = "http_test.rs"]
mod tests;
