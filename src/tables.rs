//! Typed access to the `profiles` and `images` tables.
//!
//! SYSTEM CONTEXT
//! ==============
//! Services call these helpers instead of building queries inline so the
//! column names and orderings live in one place.

use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::backend::{Backend, BackendError, Query};
use crate::models::{Image, NewImage, Profile, Role};

pub const PROFILES: &str = "profiles";
pub const IMAGES: &str = "images";

fn decode<T: DeserializeOwned>(row: serde_json::Value) -> Result<T, BackendError> {
    serde_json::from_value(row).map_err(|e| BackendError::Parse(e.to_string()))
}

fn decode_all<T: DeserializeOwned>(rows: Vec<serde_json::Value>) -> Result<Vec<T>, BackendError> {
    rows.into_iter().map(decode).collect()
}

/// Fetch the profile row for `user_id`. Errors unless exactly one exists.
pub async fn fetch_profile(backend: &dyn Backend, user_id: Uuid) -> Result<Profile, BackendError> {
    let row = backend
        .select_single(PROFILES, &Query::new().eq("id", user_id.to_string()))
        .await?;
    decode(row)
}

/// All profiles with `role`, newest first.
pub async fn list_profiles_by_role(backend: &dyn Backend, role: Role) -> Result<Vec<Profile>, BackendError> {
    let query = Query::new().eq("role", role.as_str()).order_desc("created_at");
    decode_all(backend.select(PROFILES, &query).await?)
}

/// A user's own, non-portfolio images, newest first.
pub async fn list_personal_images(backend: &dyn Backend, user_id: Uuid) -> Result<Vec<Image>, BackendError> {
    let query = Query::new()
        .eq("user_id", user_id.to_string())
        .eq("is_portfolio", false)
        .order_desc("created_at");
    decode_all(backend.select(IMAGES, &query).await?)
}

/// Every portfolio image, newest first.
pub async fn list_portfolio_images(backend: &dyn Backend) -> Result<Vec<Image>, BackendError> {
    let query = Query::new().eq("is_portfolio", true).order_desc("created_at");
    decode_all(backend.select(IMAGES, &query).await?)
}

/// Insert one image row and return it as stored.
pub async fn insert_image(backend: &dyn Backend, image: &NewImage) -> Result<Image, BackendError> {
    let row = serde_json::to_value(image).map_err(|e| BackendError::Parse(e.to_string()))?;
    let mut rows = backend.insert(IMAGES, vec![row]).await?;
    if rows.is_empty() {
        return Err(BackendError::Parse("insert returned no rows".into()));
    }
    decode(rows.remove(0))
}

#[cfg(test)]
#[path = "tables_test.rs"]
mod tests;
