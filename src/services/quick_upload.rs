//! Single-file uploader for the legacy `Images` bucket.
//!
//! Stores the file as `<epoch-millis>-<original name>`, then records its
//! public URL in `images.image_url`. Any failure aborts the operation.

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{error, info};

use crate::backend::{Backend, BackendError};
use crate::config::IMAGES_BUCKET;
use crate::services::upload::UploadFile;
use crate::tables;

#[derive(Debug, thiserror::Error)]
pub enum QuickUploadError {
    #[error("Please select an image")]
    NoFileSelected,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub struct QuickUploader {
    backend: Arc<dyn Backend>,
}

impl QuickUploader {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Upload `file` and record its public URL. Returns that URL.
    ///
    /// # Errors
    ///
    /// `NoFileSelected` before any backend call; otherwise the first
    /// backend failure. A failed row insert leaves the object stored.
    pub async fn upload(&self, file: Option<UploadFile>) -> Result<String, QuickUploadError> {
        let file = file.ok_or(QuickUploadError::NoFileSelected)?;
        let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        let path = format!("{millis}-{}", file.name);

        self.backend
            .upload(IMAGES_BUCKET, &path, file.bytes, &file.mime_type)
            .await
            .inspect_err(|e| error!(%path, error = %e, "quick upload failed"))?;

        let url = self.backend.public_url(IMAGES_BUCKET, &path);
        self.backend
            .insert(tables::IMAGES, vec![serde_json::json!({ "image_url": url })])
            .await
            .inspect_err(|e| error!(%path, error = %e, "recording image url failed"))?;

        info!(%url, "image uploaded");
        Ok(url)
    }
}

#[cfg(test)]
#[path = "quick_upload_test.rs"]
mod tests;
