use std::time::Duration;

use super::*;
use crate::backend::memory::MemoryBackend;
use crate::models::AuthEventKind;

const WAIT: Duration = Duration::from_secs(2);

async fn manager_with(backend: &Arc<MemoryBackend>) -> SessionManager {
    SessionManager::init(backend.clone(), "http://localhost:5173").await
}

async fn wait_for(reader: &mut SessionReader, predicate: impl FnMut(&AuthSnapshot) -> bool) -> AuthSnapshot {
    tokio::time::timeout(WAIT, reader.wait_for(predicate))
        .await
        .expect("timed out waiting for session state")
        .expect("session manager dropped")
}

// =============================================================================
// normalize_email
// =============================================================================

#[test]
fn normalize_email_accepts_and_trims() {
    assert_eq!(normalize_email("  ana@example.com "), Some("ana@example.com".to_owned()));
}

#[test]
fn normalize_email_rejects_bad_shapes() {
    assert_eq!(normalize_email(""), None);
    assert_eq!(normalize_email("ana"), None);
    assert_eq!(normalize_email("@example.com"), None);
    assert_eq!(normalize_email("ana@"), None);
    assert_eq!(normalize_email("a@b@c"), None);
}

// =============================================================================
// bootstrap
// =============================================================================

#[tokio::test]
async fn init_without_session_finishes_loading_anonymous() {
    let backend = Arc::new(MemoryBackend::new());
    let manager = manager_with(&backend).await;
    let snap = manager.snapshot();
    assert!(!snap.loading);
    assert!(snap.user.is_none());
    assert!(snap.profile.is_none());
    assert!(!manager.is_admin());
}

#[tokio::test]
async fn init_with_existing_session_loads_profile() {
    let backend = Arc::new(MemoryBackend::new());
    let admin = backend.seed_account("admin@example.com", "secret1", "Admin", Role::Admin);
    backend.force_sign_in(&admin);

    let manager = manager_with(&backend).await;
    let snap = manager.snapshot();
    assert_eq!(snap.user_id(), Some(admin.id));
    assert_eq!(snap.profile.as_ref().map(|p| p.role), Some(Role::Admin));
    assert!(manager.is_admin());
}

// =============================================================================
// sign-in / sign-out events
// =============================================================================

#[tokio::test]
async fn sign_in_updates_readers_through_events() {
    let backend = Arc::new(MemoryBackend::new());
    let user = backend.seed_account("ana@example.com", "secret1", "Ana", Role::User);
    let manager = manager_with(&backend).await;
    let mut reader = manager.reader();

    let session = manager.sign_in("ana@example.com", "secret1").await.unwrap();
    assert_eq!(session.user.id, user.id);

    let snap = wait_for(&mut reader, |s| s.profile.is_some()).await;
    assert_eq!(snap.user_id(), Some(user.id));
    assert!(!reader.is_admin());
}

#[tokio::test]
async fn auth_calls_publish_state_before_returning() {
    let backend = Arc::new(MemoryBackend::new());
    let admin = backend.seed_account("admin@example.com", "secret1", "Admin", Role::Admin);
    let manager = manager_with(&backend).await;
    let reader = manager.reader();

    manager.sign_in("admin@example.com", "secret1").await.unwrap();
    assert_eq!(reader.user_id(), Some(admin.id));
    assert!(reader.is_admin());

    manager.sign_out().await;
    assert!(reader.user_id().is_none());
    assert!(!reader.is_admin());

    let data = manager.sign_up("new@example.com", "p-secret", "New").await.unwrap();
    let snap = reader.snapshot();
    assert_eq!(snap.user_id(), Some(data.user.id));
    assert_eq!(snap.profile.and_then(|p| p.full_name).as_deref(), Some("New"));
}

#[tokio::test]
async fn sign_in_bad_password_returns_error_and_leaves_state() {
    let backend = Arc::new(MemoryBackend::new());
    backend.seed_account("ana@example.com", "secret1", "Ana", Role::User);
    let manager = manager_with(&backend).await;

    let err = manager.sign_in("ana@example.com", "wrong").await.unwrap_err();
    assert!(err.to_string().contains("Invalid login credentials"));
    assert!(manager.snapshot().user.is_none());
}

#[tokio::test]
async fn sign_in_invalid_email_makes_no_call() {
    let backend = Arc::new(MemoryBackend::new());
    let manager = manager_with(&backend).await;
    let before = backend.calls();
    assert!(matches!(manager.sign_in("nope", "secret1").await, Err(AuthError::InvalidEmail)));
    assert_eq!(backend.calls(), before);
}

#[tokio::test]
async fn sign_out_clears_user_and_profile() {
    let backend = Arc::new(MemoryBackend::new());
    let admin = backend.seed_account("admin@example.com", "secret1", "Admin", Role::Admin);
    backend.force_sign_in(&admin);
    let manager = manager_with(&backend).await;
    let mut reader = manager.reader();
    assert!(reader.is_admin());

    manager.sign_out().await;
    let snap = wait_for(&mut reader, |s| s.user.is_none()).await;
    assert!(snap.profile.is_none());
    assert!(!manager.is_admin());
}

#[tokio::test]
async fn sign_out_failure_is_swallowed() {
    let backend = Arc::new(MemoryBackend::new());
    let user = backend.seed_account("ana@example.com", "secret1", "Ana", Role::User);
    backend.force_sign_in(&user);
    backend.fail_sign_out();
    let manager = manager_with(&backend).await;

    manager.sign_out().await;
    assert_eq!(manager.snapshot().user_id(), Some(user.id));
}

#[tokio::test]
async fn token_refresh_refetches_profile() {
    let backend = Arc::new(MemoryBackend::new());
    let user = backend.seed_account("ana@example.com", "secret1", "Ana", Role::User);
    backend.force_sign_in(&user);
    let manager = manager_with(&backend).await;
    let mut reader = manager.reader();
    let calls_before = backend.calls();

    backend.emit(AuthEventKind::TokenRefreshed);
    assert!(tokio::time::timeout(WAIT, reader.changed()).await.unwrap());
    assert!(backend.calls() > calls_before);
    assert_eq!(reader.snapshot().user_id(), Some(user.id));
}

#[tokio::test]
async fn profile_fetch_failure_leaves_profile_unset() {
    let backend = Arc::new(MemoryBackend::new());
    let user = backend.seed_account("ana@example.com", "secret1", "Ana", Role::User);
    backend.fail_selects_on(tables::PROFILES);
    let manager = manager_with(&backend).await;
    let mut reader = manager.reader();

    manager.sign_in("ana@example.com", "secret1").await.unwrap();
    let snap = wait_for(&mut reader, |s| s.user.is_some()).await;
    assert_eq!(snap.user_id(), Some(user.id));
    assert!(snap.profile.is_none());
    assert!(!snap.is_admin());
}

#[tokio::test]
async fn disposed_manager_stops_following_events() {
    let backend = Arc::new(MemoryBackend::new());
    let user = backend.seed_account("ana@example.com", "secret1", "Ana", Role::User);
    let mut manager = manager_with(&backend).await;
    manager.dispose();
    tokio::task::yield_now().await;

    backend.force_sign_in(&user);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(manager.snapshot().user.is_none());
}

// =============================================================================
// sign-up
// =============================================================================

#[tokio::test]
async fn sign_up_profile_comes_from_backend_trigger() {
    let backend = Arc::new(MemoryBackend::new());
    let manager = manager_with(&backend).await;

    let data = manager.sign_up("e@example.com", "p-secret", "F").await.unwrap();
    assert_eq!(data.user.full_name(), Some("F"));

    let profile = tables::fetch_profile(backend.as_ref(), data.user.id).await.unwrap();
    assert_eq!(profile.full_name.as_deref(), Some("F"));
    assert_eq!(profile.role, Role::User);
    assert_eq!(backend.rows(tables::PROFILES).len(), 1);
}

#[tokio::test]
async fn sign_up_duplicate_returns_error() {
    let backend = Arc::new(MemoryBackend::new());
    backend.seed_account("e@example.com", "p-secret", "F", Role::User);
    let manager = manager_with(&backend).await;
    let err = manager.sign_up("e@example.com", "p-secret", "F").await.unwrap_err();
    assert!(matches!(err, AuthError::Backend(BackendError::Response { status: 422, .. })));
}

// =============================================================================
// magic link
// =============================================================================

#[tokio::test]
async fn magic_link_uses_configured_redirect() {
    let backend = Arc::new(MemoryBackend::new());
    let manager = manager_with(&backend).await;
    manager.sign_in_with_magic_link(" ana@example.com").await.unwrap();
    assert_eq!(
        backend.magic_links(),
        vec![("ana@example.com".to_string(), "http://localhost:5173".to_string())]
    );
}
