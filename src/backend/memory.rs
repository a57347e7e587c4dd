//! In-memory backend for tests.
//!
//! Mimics the hosted platform closely enough to drive every workflow:
//! a profile row is created on sign-up the way the backend trigger does,
//! storage rejects overwrites, rows get ids and strictly increasing
//! timestamps, and individual calls can be made to fail on demand.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{AuthApi, BackendError, Query, StorageApi, TableApi, public_object_url};
use crate::models::{AuthEvent, AuthEventKind, Role, Session, SignUpData, User};

pub const BASE_URL: &str = "http://memory.test";

#[derive(Default)]
struct Inner {
    accounts: HashMap<String, (User, String)>,
    session: Option<Session>,
    tables: HashMap<String, Vec<Value>>,
    objects: HashMap<(String, String), Vec<u8>>,
    magic_links: Vec<(String, String)>,
    clock_ms: i64,
    calls: usize,
    uploads: usize,
    inserts: usize,
    fail_upload_at: Option<usize>,
    fail_insert_at: Option<usize>,
    fail_select: Option<String>,
    fail_sign_out: bool,
}

pub struct MemoryBackend {
    inner: Mutex<Inner>,
    events: broadcast::Sender<AuthEvent>,
    epoch: OffsetDateTime,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self { inner: Mutex::new(Inner::default()), events, epoch: OffsetDateTime::now_utc() }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn next_timestamp(&self, inner: &mut Inner) -> String {
        inner.clock_ms += 1;
        (self.epoch + time::Duration::milliseconds(inner.clock_ms))
            .format(&Rfc3339)
            .unwrap_or_default()
    }

    fn set_session(&self, session: Option<Session>, kind: AuthEventKind) {
        self.lock().session = session.clone();
        let _ = self.events.send(AuthEvent { kind, session });
    }

    fn new_session(user: User) -> Session {
        Session {
            access_token: Uuid::new_v4().to_string(),
            refresh_token: Uuid::new_v4().to_string(),
            expires_at: OffsetDateTime::now_utc().unix_timestamp() + 3600,
            user,
        }
    }

    // -------------------------------------------------------------------------
    // seeding and inspection
    // -------------------------------------------------------------------------

    /// Create an account plus its profile row, without signing in.
    pub fn seed_account(&self, email: &str, password: &str, full_name: &str, role: Role) -> User {
        let mut metadata = serde_json::Map::new();
        metadata.insert("full_name".into(), json!(full_name));
        let user = User { id: Uuid::new_v4(), email: Some(email.to_string()), user_metadata: metadata };
        let mut inner = self.lock();
        let created_at = self.next_timestamp(&mut inner);
        inner.accounts.insert(email.to_string(), (user.clone(), password.to_string()));
        inner.tables.entry("profiles".into()).or_default().push(json!({
            "id": user.id,
            "email": email,
            "full_name": full_name,
            "role": role.as_str(),
            "created_at": created_at,
        }));
        user
    }

    /// Sign an existing account in directly, emitting `SignedIn`.
    pub fn force_sign_in(&self, user: &User) {
        self.set_session(Some(Self::new_session(user.clone())), AuthEventKind::SignedIn);
    }

    /// Insert a raw row, filling id and timestamp like the backend would.
    pub fn seed_row(&self, table: &str, mut row: Value) -> Value {
        let mut inner = self.lock();
        let created_at = self.next_timestamp(&mut inner);
        fill_defaults(table, &mut row, created_at);
        inner.tables.entry(table.into()).or_default().push(row.clone());
        row
    }

    /// Broadcast an arbitrary event, e.g. a token refresh.
    pub fn emit(&self, kind: AuthEventKind) {
        let session = self.lock().session.clone();
        let _ = self.events.send(AuthEvent { kind, session });
    }

    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn object(&self, bucket: &str, path: &str) -> Option<Vec<u8>> {
        self.lock().objects.get(&(bucket.to_string(), path.to_string())).cloned()
    }

    #[must_use]
    pub fn object_paths(&self, bucket: &str) -> Vec<String> {
        let mut paths: Vec<String> = self
            .lock()
            .objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, p)| p.clone())
            .collect();
        paths.sort();
        paths
    }

    #[must_use]
    pub fn magic_links(&self) -> Vec<(String, String)> {
        self.lock().magic_links.clone()
    }

    /// Number of backend calls made so far (`public_url` excluded: it is local).
    #[must_use]
    pub fn calls(&self) -> usize {
        self.lock().calls
    }

    /// Make the `n`th upload (1-based, counted from now) fail.
    pub fn fail_upload_at(&self, n: usize) {
        let mut inner = self.lock();
        inner.fail_upload_at = Some(inner.uploads + n);
    }

    /// Make the `n`th insert (1-based, counted from now) fail.
    pub fn fail_insert_at(&self, n: usize) {
        let mut inner = self.lock();
        inner.fail_insert_at = Some(inner.inserts + n);
    }

    pub fn fail_selects_on(&self, table: &str) {
        self.lock().fail_select = Some(table.to_string());
    }

    pub fn fail_sign_out(&self) {
        self.lock().fail_sign_out = true;
    }
}

fn fill_defaults(table: &str, row: &mut Value, created_at: String) {
    let Some(obj) = row.as_object_mut() else {
        return;
    };
    obj.entry("id").or_insert_with(|| json!(Uuid::new_v4()));
    obj.entry("created_at").or_insert_with(|| json!(created_at));
    if table == "images" {
        obj.entry("is_portfolio").or_insert(json!(false));
        obj.entry("caption").or_insert(Value::Null);
    }
}

fn rejected(status: u16, message: &str) -> BackendError {
    BackendError::Response { status, message: message.to_string() }
}

#[async_trait::async_trait]
impl AuthApi for MemoryBackend {
    async fn get_session(&self) -> Result<Option<Session>, BackendError> {
        let mut inner = self.lock();
        inner.calls += 1;
        Ok(inner.session.clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: serde_json::Map<String, Value>,
    ) -> Result<SignUpData, BackendError> {
        let user = {
            let mut inner = self.lock();
            inner.calls += 1;
            if inner.accounts.contains_key(email) {
                return Err(rejected(422, "User already registered"));
            }
            if password.len() < 6 {
                return Err(rejected(422, "Password should be at least 6 characters"));
            }
            let user = User { id: Uuid::new_v4(), email: Some(email.to_string()), user_metadata: metadata };
            inner.accounts.insert(email.to_string(), (user.clone(), password.to_string()));

            // Stand-in for the backend's `on_auth_user_created` trigger.
            let created_at = self.next_timestamp(&mut inner);
            inner.tables.entry("profiles".into()).or_default().push(json!({
                "id": user.id,
                "email": email,
                "full_name": user.full_name(),
                "role": "user",
                "created_at": created_at,
            }));
            user
        };
        let session = Self::new_session(user.clone());
        self.set_session(Some(session.clone()), AuthEventKind::SignedIn);
        Ok(SignUpData { user, session: Some(session) })
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, BackendError> {
        let user = {
            let mut inner = self.lock();
            inner.calls += 1;
            match inner.accounts.get(email) {
                Some((user, stored)) if stored == password => user.clone(),
                _ => return Err(rejected(400, "Invalid login credentials")),
            }
        };
        let session = Self::new_session(user);
        self.set_session(Some(session.clone()), AuthEventKind::SignedIn);
        Ok(session)
    }

    async fn sign_in_with_otp(&self, email: &str, redirect_to: &str) -> Result<(), BackendError> {
        let mut inner = self.lock();
        inner.calls += 1;
        if !email.contains('@') {
            return Err(rejected(400, "Unable to validate email address: invalid format"));
        }
        inner.magic_links.push((email.to_string(), redirect_to.to_string()));
        Ok(())
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        {
            let mut inner = self.lock();
            inner.calls += 1;
            if inner.fail_sign_out {
                return Err(rejected(500, "logout failed"));
            }
        }
        self.set_session(None, AuthEventKind::SignedOut);
        Ok(())
    }

    async fn get_user(&self) -> Result<Option<User>, BackendError> {
        let mut inner = self.lock();
        inner.calls += 1;
        Ok(inner.session.as_ref().map(|s| s.user.clone()))
    }
}

#[async_trait::async_trait]
impl StorageApi for MemoryBackend {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<String, BackendError> {
        let mut inner = self.lock();
        inner.calls += 1;
        inner.uploads += 1;
        if inner.fail_upload_at == Some(inner.uploads) {
            return Err(rejected(500, "storage unavailable"));
        }
        let key = (bucket.to_string(), path.to_string());
        if inner.objects.contains_key(&key) {
            return Err(rejected(409, "The resource already exists"));
        }
        inner.objects.insert(key, bytes);
        Ok(path.to_string())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        public_object_url(BASE_URL, bucket, path)
    }
}

#[async_trait::async_trait]
impl TableApi for MemoryBackend {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>, BackendError> {
        let mut inner = self.lock();
        inner.calls += 1;
        if inner.fail_select.as_deref() == Some(table) {
            return Err(rejected(500, "query failed"));
        }
        let mut rows = inner.tables.get(table).cloned().unwrap_or_default();
        query.apply(&mut rows);
        Ok(rows)
    }

    async fn select_single(&self, table: &str, query: &Query) -> Result<Value, BackendError> {
        let mut rows = self.select(table, query).await?;
        if rows.len() != 1 {
            return Err(BackendError::NotSingle);
        }
        Ok(rows.remove(0))
    }

    async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<Vec<Value>, BackendError> {
        let mut inner = self.lock();
        inner.calls += 1;
        inner.inserts += 1;
        if inner.fail_insert_at == Some(inner.inserts) {
            return Err(rejected(403, "new row violates row-level security policy"));
        }
        let mut inserted = Vec::with_capacity(rows.len());
        for mut row in rows {
            let created_at = self.next_timestamp(&mut inner);
            fill_defaults(table, &mut row, created_at);
            inner.tables.entry(table.into()).or_default().push(row.clone());
            inserted.push(row);
        }
        Ok(inserted)
    }
}
