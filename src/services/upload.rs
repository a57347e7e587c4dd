//! Admin upload panel: per-user and portfolio batch uploads.
//!
//! DESIGN
//! ======
//! Each file goes through the same two-step sequence: store the object,
//! then insert the `images` row that points at it. Files are processed
//! strictly one at a time. Progress is published through a watch channel
//! after every completed file.
//!
//! TRADE-OFFS
//! ==========
//! The first failure aborts the rest of the batch and nothing is rolled
//! back: earlier files stay stored with their rows, and a storage write
//! whose row insert failed leaves an orphaned object. The error carries the
//! list of completed records so a caller can compensate if it wants to.
//!
//! Cancellation is cooperative and checked between files, never inside
//! the object/row pair.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::Rng;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backend::{Backend, BackendError};
use crate::config::GALLERY_BUCKET;
use crate::models::{Image, NewImage, Profile, Role};
use crate::services::session::SessionReader;
use crate::tables;

const SUFFIX_LEN: usize = 6;
const SUFFIX_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const PORTFOLIO_PREFIX: &str = "portfolio";

// =============================================================================
// FILES
// =============================================================================

/// A file picked for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub name: String,
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl UploadFile {
    /// Build from in-memory bytes, guessing the MIME type from the name.
    #[must_use]
    pub fn new(name: &str, bytes: Vec<u8>) -> Self {
        Self { name: name.to_string(), mime_type: guess_mime(name).to_string(), bytes }
    }

    /// Read a file from disk; the upload keeps only its base name.
    ///
    /// # Errors
    ///
    /// Propagates the read error.
    pub async fn from_path(path: &Path) -> Result<Self, std::io::Error> {
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        Ok(Self::new(&name, bytes))
    }

    #[must_use]
    pub fn size(&self) -> i64 {
        i64::try_from(self.bytes.len()).unwrap_or(i64::MAX)
    }
}

/// Text after the last `.`, if any.
#[must_use]
pub fn extension(name: &str) -> Option<&str> {
    name.rsplit_once('.').map(|(_, ext)| ext).filter(|ext| !ext.is_empty())
}

#[must_use]
pub fn guess_mime(name: &str) -> &'static str {
    match extension(name).map(str::to_ascii_lowercase).as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("avif") => "image/avif",
        Some("bmp") => "image/bmp",
        Some("tif" | "tiff") => "image/tiff",
        Some("heic") => "image/heic",
        _ => "application/octet-stream",
    }
}

fn epoch_millis() -> i128 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000
}

fn random_suffix() -> String {
    let mut rng = rand::rng();
    (0..SUFFIX_LEN)
        .map(|_| SUFFIX_ALPHABET[rng.random_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect()
}

/// Collision-resistant storage name: `<epoch-millis>-<base36 suffix>.<ext>`.
/// Names without an extension get none.
#[must_use]
pub fn generate_file_name(original: &str) -> String {
    let stem = format!("{}-{}", epoch_millis(), random_suffix());
    match extension(original) {
        Some(ext) => format!("{stem}.{ext}"),
        None => stem,
    }
}

// =============================================================================
// STATUS / OUTCOME
// =============================================================================

/// Observable upload state. `progress` is a percentage in `0.0..=100.0`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct UploadStatus {
    pub uploading: bool,
    pub progress: f64,
}

#[allow(clippy::cast_precision_loss)]
fn percent(done: usize, total: usize) -> f64 {
    if total == 0 { 0.0 } else { done as f64 / total as f64 * 100.0 }
}

/// Records created by a batch that ran to completion.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    pub uploaded: Vec<Image>,
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("no files selected")]
    NoFiles,
    #[error("no user selected")]
    NoUserSelected,
    #[error("unknown user: {0}")]
    UnknownUser(Uuid),
    #[error("admin role required")]
    NotAdmin,
    #[error("not signed in")]
    NotSignedIn,
    #[error("upload cancelled after {} file(s)", .completed.len())]
    Cancelled { completed: Vec<Image> },
    #[error("error uploading {file}: {source}")]
    Failed {
        file: String,
        /// Records stored before the failure; they are not rolled back.
        completed: Vec<Image>,
        /// Progress reached when the failure happened.
        progress: f64,
        source: BackendError,
    },
}

impl UploadError {
    /// Records that were persisted before the batch stopped.
    #[must_use]
    pub fn completed(&self) -> &[Image] {
        match self {
            Self::Cancelled { completed } | Self::Failed { completed, .. } => completed,
            _ => &[],
        }
    }
}

/// Cooperative cancel switch for the running (or next) batch.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// PANEL
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Target {
    User(Uuid),
    Portfolio { admin_id: Uuid },
}

impl Target {
    fn storage_path(self, name: &str) -> String {
        match self {
            Self::User(id) => format!("{id}/{name}"),
            Self::Portfolio { .. } => format!("{PORTFOLIO_PREFIX}/{name}"),
        }
    }

    fn owner(self) -> Uuid {
        match self {
            Self::User(id) | Self::Portfolio { admin_id: id } => id,
        }
    }

    fn is_portfolio(self) -> bool {
        matches!(self, Self::Portfolio { .. })
    }
}

enum Stop {
    Cancelled,
    Failed { file: String, source: BackendError },
}

pub struct UploadPanel {
    backend: Arc<dyn Backend>,
    session: SessionReader,
    users: Vec<Profile>,
    selected: Option<Profile>,
    status: watch::Sender<UploadStatus>,
    cancel: CancelHandle,
}

impl UploadPanel {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, session: SessionReader) -> Self {
        let (status, _) = watch::channel(UploadStatus::default());
        Self { backend, session, users: Vec::new(), selected: None, status, cancel: CancelHandle::default() }
    }

    /// Fetch every non-admin profile, newest first. On failure the error is
    /// logged and the previous list kept.
    pub async fn load_users(&mut self) -> &[Profile] {
        match tables::list_profiles_by_role(self.backend.as_ref(), Role::User).await {
            Ok(users) => self.users = users,
            Err(e) => error!(error = %e, "error fetching users"),
        }
        &self.users
    }

    #[must_use]
    pub fn users(&self) -> &[Profile] {
        &self.users
    }

    /// Select one of the loaded users as the upload target.
    ///
    /// # Errors
    ///
    /// `UnknownUser` if the id is not in the loaded list.
    pub fn select_user(&mut self, user_id: Uuid) -> Result<&Profile, UploadError> {
        let profile = self
            .users
            .iter()
            .find(|p| p.id == user_id)
            .cloned()
            .ok_or(UploadError::UnknownUser(user_id))?;
        Ok(self.selected.insert(profile))
    }

    #[must_use]
    pub fn selected_user(&self) -> Option<&Profile> {
        self.selected.as_ref()
    }

    #[must_use]
    pub fn status(&self) -> watch::Receiver<UploadStatus> {
        self.status.subscribe()
    }

    #[must_use]
    pub fn is_uploading(&self) -> bool {
        self.status.borrow().uploading
    }

    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Upload `files` into the selected user's namespace.
    ///
    /// # Errors
    ///
    /// Validation errors (`NoFiles`, `NoUserSelected`, `NotAdmin`) before any
    /// backend call; `Failed` or `Cancelled` with the completed records otherwise.
    pub async fn upload_files(&mut self, files: Vec<UploadFile>) -> Result<BatchReport, UploadError> {
        if files.is_empty() {
            return Err(UploadError::NoFiles);
        }
        let user_id = self.selected.as_ref().map(|p| p.id).ok_or(UploadError::NoUserSelected)?;
        self.require_admin()?;
        self.run_batch(files, Target::User(user_id)).await
    }

    /// Upload `files` as portfolio images owned by the signed-in admin.
    ///
    /// # Errors
    ///
    /// Same as [`UploadPanel::upload_files`], minus the user selection.
    pub async fn upload_portfolio(&mut self, files: Vec<UploadFile>) -> Result<BatchReport, UploadError> {
        if files.is_empty() {
            return Err(UploadError::NoFiles);
        }
        let admin_id = self.require_admin()?;
        self.run_batch(files, Target::Portfolio { admin_id }).await
    }

    fn require_admin(&self) -> Result<Uuid, UploadError> {
        let snapshot = self.session.snapshot();
        let user_id = snapshot.user_id().ok_or(UploadError::NotSignedIn)?;
        if !snapshot.is_admin() {
            return Err(UploadError::NotAdmin);
        }
        Ok(user_id)
    }

    async fn run_batch(&self, files: Vec<UploadFile>, target: Target) -> Result<BatchReport, UploadError> {
        let total = files.len();
        let mut completed = Vec::with_capacity(total);
        self.status.send_replace(UploadStatus { uploading: true, progress: 0.0 });

        let outcome = self.process(files, target, &mut completed).await;
        let progress = percent(completed.len(), total);

        self.status.send_replace(UploadStatus::default());
        self.cancel.reset();

        match outcome {
            Ok(()) => {
                info!(uploaded = completed.len(), portfolio = target.is_portfolio(), "batch uploaded");
                Ok(BatchReport { uploaded: completed })
            }
            Err(Stop::Cancelled) => {
                warn!(uploaded = completed.len(), total, "batch cancelled");
                Err(UploadError::Cancelled { completed })
            }
            Err(Stop::Failed { file, source }) => {
                error!(%file, uploaded = completed.len(), total, error = %source, "error uploading files");
                Err(UploadError::Failed { file, completed, progress, source })
            }
        }
    }

    async fn process(&self, files: Vec<UploadFile>, target: Target, completed: &mut Vec<Image>) -> Result<(), Stop> {
        let total = files.len();
        for file in files {
            if self.cancel.is_cancelled() {
                return Err(Stop::Cancelled);
            }
            let display_name = file.name.clone();
            let image = self
                .upload_one(file, target)
                .await
                .map_err(|source| Stop::Failed { file: display_name, source })?;
            completed.push(image);
            let progress = percent(completed.len(), total);
            self.status.send_modify(|s| s.progress = progress);
        }
        Ok(())
    }

    async fn upload_one(&self, file: UploadFile, target: Target) -> Result<Image, BackendError> {
        let size = file.size();
        let UploadFile { name, bytes, mime_type } = file;
        let path = target.storage_path(&generate_file_name(&name));

        self.backend.upload(GALLERY_BUCKET, &path, bytes, &mime_type).await?;
        let row = NewImage {
            user_id: target.owner(),
            file_name: name,
            file_path: path,
            file_size: size,
            mime_type,
            is_portfolio: target.is_portfolio(),
        };
        let image = tables::insert_image(self.backend.as_ref(), &row).await?;
        info!(path = %image.file_path, "image stored");
        Ok(image)
    }
}

#[cfg(test)]
#[path = "upload_test.rs"]
mod tests;
