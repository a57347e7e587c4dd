//! Auth session manager: current user, profile, and loading state.
//!
//! ARCHITECTURE
//! ============
//! One writer, many readers. `SessionManager` owns the `watch::Sender` and
//! the task that applies backend session-change events; everything else
//! holds a `SessionReader` and can only observe.
//!
//! Lifecycle: `init` subscribes to events *before* bootstrapping the
//! current session so nothing emitted in between is lost, then publishes
//! the first snapshot with `loading = false`. `dispose` (or drop) aborts the
//! event task, which is the unsubscribe.
//!
//! Auth calls made through the manager publish their outcome before they
//! return. The event task covers changes the backend starts on its own
//! (refresh, expiry). It applies the backend's current session rather than
//! the one carried by the event, so an event that arrives after a direct
//! update cannot roll the state back.
//!
//! ERROR HANDLING
//! ==============
//! Sign-up and both sign-in flows return `Result`. Sign-out and profile
//! fetch failures are logged and otherwise ignored.

use std::sync::Arc;

use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{Backend, BackendError};
use crate::models::{AuthEvent, Profile, Role, Session, SignUpData, User};
use crate::tables;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid email")]
    InvalidEmail,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Trimmed email if it has the `local@domain` shape, else `None`.
#[must_use]
pub fn normalize_email(email: &str) -> Option<String> {
    let normalized = email.trim();
    let mut parts = normalized.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) if !local.is_empty() && !domain.is_empty() => Some(normalized.to_owned()),
        _ => None,
    }
}

// =============================================================================
// SNAPSHOT / READER
// =============================================================================

/// What every component may know about authentication at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthSnapshot {
    pub user: Option<User>,
    pub profile: Option<Profile>,
    /// True until the initial session bootstrap has finished.
    pub loading: bool,
}

impl Default for AuthSnapshot {
    fn default() -> Self {
        Self { user: None, profile: None, loading: true }
    }
}

impl AuthSnapshot {
    #[must_use]
    pub fn user_id(&self) -> Option<Uuid> {
        self.user.as_ref().map(|u| u.id)
    }

    /// True iff a profile is loaded and its role is `admin`.
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.profile.as_ref().is_some_and(|p| p.role == Role::Admin)
    }
}

/// Read-only handle on the session state.
#[derive(Debug, Clone)]
pub struct SessionReader {
    rx: watch::Receiver<AuthSnapshot>,
}

impl SessionReader {
    #[must_use]
    pub fn snapshot(&self) -> AuthSnapshot {
        self.rx.borrow().clone()
    }

    #[must_use]
    pub fn user_id(&self) -> Option<Uuid> {
        self.rx.borrow().user_id()
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.rx.borrow().is_admin()
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.rx.borrow().loading
    }

    /// Wait for the next published snapshot. `false` once the manager is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    /// Wait until `predicate` holds, returning the matching snapshot.
    /// `None` once the manager is gone.
    pub async fn wait_for(&mut self, predicate: impl FnMut(&AuthSnapshot) -> bool) -> Option<AuthSnapshot> {
        self.rx.wait_for(predicate).await.ok().map(|s| s.clone())
    }
}

// =============================================================================
// MANAGER
// =============================================================================

pub struct SessionManager {
    backend: Arc<dyn Backend>,
    state: Arc<watch::Sender<AuthSnapshot>>,
    /// Held while reading a session and publishing it.
    apply_lock: Arc<Mutex<()>>,
    redirect_url: String,
    events_task: Option<JoinHandle<()>>,
}

impl SessionManager {
    /// Subscribe to session changes, bootstrap the current session and its
    /// profile, and start applying events.
    pub async fn init(backend: Arc<dyn Backend>, redirect_url: impl Into<String>) -> Self {
        let (tx, _) = watch::channel(AuthSnapshot::default());
        let state = Arc::new(tx);
        let events = backend.subscribe();

        let user = match backend.get_session().await {
            Ok(session) => session.map(|s| s.user),
            Err(e) => {
                error!(error = %e, "error initializing auth");
                None
            }
        };
        let profile = match &user {
            Some(user) => load_profile(backend.as_ref(), user.id).await,
            None => None,
        };
        state.send_modify(|s| {
            s.user = user;
            s.profile = profile;
            s.loading = false;
        });

        let apply_lock = Arc::new(Mutex::new(()));
        let events_task = tokio::spawn(run_event_loop(backend.clone(), state.clone(), apply_lock.clone(), events));
        Self { backend, state, apply_lock, redirect_url: redirect_url.into(), events_task: Some(events_task) }
    }

    #[must_use]
    pub fn reader(&self) -> SessionReader {
        SessionReader { rx: self.state.subscribe() }
    }

    #[must_use]
    pub fn snapshot(&self) -> AuthSnapshot {
        self.state.borrow().clone()
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.state.borrow().is_admin()
    }

    /// Create an account with `full_name` as user metadata. The profile row
    /// is the backend trigger's job, not ours.
    ///
    /// # Errors
    ///
    /// `InvalidEmail` before any call, otherwise the backend's rejection.
    pub async fn sign_up(&self, email: &str, password: &str, full_name: &str) -> Result<SignUpData, AuthError> {
        let email = normalize_email(email).ok_or(AuthError::InvalidEmail)?;
        let mut metadata = serde_json::Map::new();
        metadata.insert("full_name".into(), serde_json::Value::String(full_name.to_string()));
        let data = self.backend.sign_up(&email, password, metadata).await?;
        info!(user_id = %data.user.id, confirmed = data.session.is_some(), "signed up");
        if data.session.is_some() {
            self.publish(data.session.clone()).await;
        }
        Ok(data)
    }

    /// # Errors
    ///
    /// `InvalidEmail` before any call, otherwise the backend's rejection
    /// (bad credentials, unconfirmed account).
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let email = normalize_email(email).ok_or(AuthError::InvalidEmail)?;
        let session = self.backend.sign_in_with_password(&email, password).await?;
        info!(user_id = %session.user.id, "signed in");
        self.publish(Some(session.clone())).await;
        Ok(session)
    }

    /// Send a passwordless sign-in link that returns to the configured redirect URL.
    ///
    /// # Errors
    ///
    /// `InvalidEmail` before any call, otherwise the backend's rejection.
    pub async fn sign_in_with_magic_link(&self, email: &str) -> Result<(), AuthError> {
        let email = normalize_email(email).ok_or(AuthError::InvalidEmail)?;
        self.backend.sign_in_with_otp(&email, &self.redirect_url).await?;
        info!(redirect_to = %self.redirect_url, "magic link sent");
        Ok(())
    }

    /// Clear the session. Failures are logged, never returned, and leave
    /// the state to whatever the backend reports afterwards.
    pub async fn sign_out(&self) {
        match self.backend.sign_out().await {
            Ok(()) => {
                info!("signed out");
                self.publish(None).await;
            }
            Err(e) => error!(error = %e, "error signing out"),
        }
    }

    async fn publish(&self, session: Option<Session>) {
        let _guard = self.apply_lock.lock().await;
        apply_session(self.backend.as_ref(), &self.state, session).await;
    }

    /// Stop applying session-change events.
    pub fn dispose(&mut self) {
        if let Some(task) = self.events_task.take() {
            task.abort();
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

// =============================================================================
// EVENT LOOP
// =============================================================================

async fn run_event_loop(
    backend: Arc<dyn Backend>,
    state: Arc<watch::Sender<AuthSnapshot>>,
    apply_lock: Arc<Mutex<()>>,
    mut events: broadcast::Receiver<AuthEvent>,
) {
    loop {
        let fallback = match events.recv().await {
            Ok(event) => {
                debug!(kind = ?event.kind, "auth event");
                event.session
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "auth events lagged; resyncing session");
                None
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let _guard = apply_lock.lock().await;
        let session = match backend.get_session().await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "error reading session; using event payload");
                fallback
            }
        };
        apply_session(backend.as_ref(), &state, session).await;
    }
}

/// Publish `session` and its profile as the current snapshot.
async fn apply_session(backend: &dyn Backend, state: &watch::Sender<AuthSnapshot>, session: Option<Session>) {
    let user = session.map(|s| s.user);
    let previous = state.borrow().clone();
    let profile = match &user {
        Some(user) => match load_profile(backend, user.id).await {
            Some(profile) => Some(profile),
            // Keep a profile we already had for this same user.
            None => previous.profile.filter(|p| p.id == user.id),
        },
        None => None,
    };
    state.send_modify(|s| {
        s.user = user;
        s.profile = profile;
        s.loading = false;
    });
}

/// Fetch a profile, logging and swallowing failures.
async fn load_profile(backend: &dyn Backend, user_id: Uuid) -> Option<Profile> {
    match tables::fetch_profile(backend, user_id).await {
        Ok(profile) => Some(profile),
        Err(e) => {
            error!(%user_id, error = %e, "error fetching profile");
            None
        }
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
