//! Typed rows and auth payloads exchanged with the hosted backend.
//!
//! DESIGN
//! ======
//! These mirror the backend's own records (`auth.users`, `profiles`,
//! `images`). The client never owns their schema; fields are optional
//! wherever the backend may omit them so a newer server stays readable.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// AUTH
// =============================================================================

/// Identity record managed by the backend auth service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    #[serde(default)]
    pub email: Option<String>,
    /// Free-form metadata attached at sign-up (`full_name`).
    #[serde(default)]
    pub user_metadata: serde_json::Map<String, serde_json::Value>,
}

impl User {
    /// The `full_name` metadata entry, if one was attached at sign-up.
    #[must_use]
    pub fn full_name(&self) -> Option<&str> {
        self.user_metadata.get("full_name").and_then(serde_json::Value::as_str)
    }
}

/// Backend-issued proof of authentication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    /// Absolute expiry as unix seconds.
    pub expires_at: i64,
    pub user: User,
}

impl Session {
    /// True once the access token is past its expiry.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        OffsetDateTime::now_utc().unix_timestamp() >= self.expires_at
    }
}

/// Result of a sign-up. The session is absent when the backend requires
/// email confirmation before the first sign-in.
#[derive(Debug, Clone, PartialEq)]
pub struct SignUpData {
    pub user: User,
    pub session: Option<Session>,
}

/// Session-change notification kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEventKind {
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

/// A session-change notification: the event plus the session it left behind.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthEvent {
    pub kind: AuthEventKind,
    pub session: Option<Session>,
}

// =============================================================================
// PROFILE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }
}

/// One row of the `profiles` table, created by a backend trigger on sign-up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    pub role: Role,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Profile {
    /// Name shown in user lists: full name, else email, else the id.
    #[must_use]
    pub fn display_name(&self) -> String {
        self.full_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .or(self.email.as_deref())
            .map_or_else(|| self.id.to_string(), str::to_owned)
    }
}

// =============================================================================
// IMAGE
// =============================================================================

/// One row of the `images` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub file_name: String,
    pub file_path: String,
    #[serde(default)]
    pub file_size: Option<i64>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub is_portfolio: bool,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Insert payload for `images`; id and timestamp are assigned by the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewImage {
    pub user_id: Uuid,
    pub file_name: String,
    pub file_path: String,
    pub file_size: i64,
    pub mime_type: String,
    pub is_portfolio: bool,
}

#[cfg(test)]
#[path = "models_test.rs"]
mod tests;
