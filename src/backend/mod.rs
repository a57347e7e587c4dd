//! Backend-as-a-service boundary: auth, object storage, and table access.
//!
//! ARCHITECTURE
//! ============
//! The hosted platform is a fixed external contract. Services depend on the
//! `Backend` trait object, never on HTTP directly, so every workflow can be
//! exercised against the in-memory backend in tests.
//!
//! ERROR HANDLING
//! ==============
//! Every call is attempted exactly once. Failures surface as `BackendError`
//! and the caller decides whether to report, log, or abort.

pub mod http;
pub mod query;

#[cfg(test)]
pub mod memory;

use tokio::sync::broadcast;

use crate::models::{AuthEvent, Session, SignUpData, User};
pub use query::Query;

// =============================================================================
// ERROR
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The request never produced a response (DNS, TLS, timeout).
    #[error("request failed: {0}")]
    Request(String),

    /// The backend answered with a non-success status.
    #[error("{message} (status {status})")]
    Response { status: u16, message: String },

    /// The response body did not match the expected shape.
    #[error("response parse failed: {0}")]
    Parse(String),

    /// A single-row fetch matched zero or several rows.
    #[error("expected exactly one row")]
    NotSingle,

    #[error("not signed in")]
    NotSignedIn,

    #[error("HTTP client build failed: {0}")]
    HttpClientBuild(String),

    #[error("session store error: {0}")]
    SessionStore(#[from] std::io::Error),
}

// =============================================================================
// TRAITS
// =============================================================================

/// Auth service: sessions, credentials, and session-change notifications.
#[async_trait::async_trait]
pub trait AuthApi: Send + Sync {
    /// Current session, refreshed first if it has expired.
    async fn get_session(&self) -> Result<Option<Session>, BackendError>;

    /// Subscribe to session changes. Events emitted before the call are not replayed.
    fn subscribe(&self) -> broadcast::Receiver<AuthEvent>;

    /// Create an account; `metadata` is stored as the user's metadata map.
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<SignUpData, BackendError>;

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, BackendError>;

    /// Send a passwordless sign-in link that lands on `redirect_to`.
    async fn sign_in_with_otp(&self, email: &str, redirect_to: &str) -> Result<(), BackendError>;

    async fn sign_out(&self) -> Result<(), BackendError>;

    /// The user behind the current session, as the auth service sees it.
    async fn get_user(&self) -> Result<Option<User>, BackendError>;
}

/// Object storage.
#[async_trait::async_trait]
pub trait StorageApi: Send + Sync {
    /// Store `bytes` at `path` inside `bucket`. Returns the stored path.
    async fn upload(&self, bucket: &str, path: &str, bytes: Vec<u8>, content_type: &str)
    -> Result<String, BackendError>;

    /// Publicly resolvable URL for a stored path. Pure string construction.
    fn public_url(&self, bucket: &str, path: &str) -> String;
}

/// Relational store.
#[async_trait::async_trait]
pub trait TableApi: Send + Sync {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<serde_json::Value>, BackendError>;

    /// Like `select`, but errors with `NotSingle` unless exactly one row matches.
    async fn select_single(&self, table: &str, query: &Query) -> Result<serde_json::Value, BackendError>;

    async fn insert(&self, table: &str, rows: Vec<serde_json::Value>) -> Result<Vec<serde_json::Value>, BackendError>;
}

/// The whole hosted platform as one injectable dependency.
pub trait Backend: AuthApi + StorageApi + TableApi {}

impl<T: AuthApi + StorageApi + TableApi> Backend for T {}

/// Shared `{base}/storage/v1/object/public/{bucket}/{path}` derivation.
#[must_use]
pub fn public_object_url(base_url: &str, bucket: &str, path: &str) -> String {
    format!(
        "{}/storage/v1/object/public/{bucket}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
