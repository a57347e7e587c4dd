//! Gallery viewer: a user's own images, or the shared portfolio.
//!
//! DESIGN
//! ======
//! Personal images are fetched first; only an empty result triggers the
//! portfolio fetch. The two result sets are never merged. Image URLs are
//! derived locally from the stored path, so rendering makes no extra calls.
//!
//! State machine per viewer: `Loading -> Ready(Personal | Portfolio)`, and
//! back to `Loading` whenever the signed-in identity changes.

use std::fmt::Write as _;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;

use crate::backend::{Backend, BackendError};
use crate::config::GALLERY_BUCKET;
use crate::models::Image;
use crate::services::session::SessionReader;
use crate::tables;

pub const PORTFOLIO_NOTICE: &str =
    "You don't have any photos yet. Here's our photographer's portfolio while you wait!";
pub const EMPTY_NOTICE: &str = "No images available yet.";

#[derive(Debug, thiserror::Error)]
pub enum GalleryError {
    #[error("error fetching images: {0}")]
    Fetch(#[from] BackendError),
}

// =============================================================================
// VIEW
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GalleryMode {
    Personal,
    Portfolio,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GalleryItem {
    pub image: Image,
    pub url: String,
}

/// One rendered result set: either the user's images or the portfolio.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryView {
    pub mode: GalleryMode,
    pub items: Vec<GalleryItem>,
}

impl GalleryView {
    #[must_use]
    pub fn empty() -> Self {
        Self { mode: GalleryMode::Personal, items: Vec::new() }
    }

    #[must_use]
    pub fn title(&self) -> &'static str {
        match self.mode {
            GalleryMode::Personal => "My Gallery",
            GalleryMode::Portfolio => "Photographer Portfolio",
        }
    }

    /// Banner shown above the portfolio fallback.
    #[must_use]
    pub fn notice(&self) -> Option<&'static str> {
        (self.mode == GalleryMode::Portfolio).then_some(PORTFOLIO_NOTICE)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Static page with one lazily loaded `<img>` per item.
    #[must_use]
    pub fn to_html(&self) -> String {
        let title = escape_html(self.title());
        let mut html = String::new();
        let _ = writeln!(html, "<!doctype html>");
        let _ = writeln!(html, "<html><head><meta charset=\"utf-8\"><title>{title}</title></head><body>");
        let _ = writeln!(html, "<h1>{title}</h1>");
        if let Some(notice) = self.notice() {
            let _ = writeln!(html, "<p class=\"notice\">{}</p>", escape_html(notice));
        }
        if self.is_empty() {
            let _ = writeln!(html, "<p class=\"empty\">{}</p>", escape_html(EMPTY_NOTICE));
        } else {
            let _ = writeln!(html, "<div class=\"grid\">");
            for item in &self.items {
                let _ = write!(
                    html,
                    "<figure><img src=\"{}\" alt=\"{}\" loading=\"lazy\">",
                    escape_html(&item.url),
                    escape_html(&item.image.file_name)
                );
                if let Some(caption) = &item.image.caption {
                    let _ = write!(html, "<figcaption>{}</figcaption>", escape_html(caption));
                }
                let _ = writeln!(html, "</figure>");
            }
            let _ = writeln!(html, "</div>");
        }
        let _ = writeln!(html, "</body></html>");
        html
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub enum GalleryState {
    Loading,
    Ready(GalleryView),
}

// =============================================================================
// VIEWER
// =============================================================================

pub struct GalleryViewer {
    backend: Arc<dyn Backend>,
    state: Arc<watch::Sender<GalleryState>>,
    follow_task: Option<JoinHandle<()>>,
}

impl GalleryViewer {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let (state, _) = watch::channel(GalleryState::Loading);
        Self { backend, state: Arc::new(state), follow_task: None }
    }

    /// Public URL for a stored path. Local string construction only.
    #[must_use]
    pub fn image_url(&self, file_path: &str) -> String {
        self.backend.public_url(GALLERY_BUCKET, file_path)
    }

    /// Fetch the view for `user_id`: personal images, or the portfolio when
    /// the user has none.
    ///
    /// # Errors
    ///
    /// `Fetch` if either query fails.
    pub async fn load(&self, user_id: Uuid) -> Result<GalleryView, GalleryError> {
        load_view(self.backend.as_ref(), user_id).await
    }

    #[must_use]
    pub fn state(&self) -> watch::Receiver<GalleryState> {
        self.state.subscribe()
    }

    /// Re-enter `Loading` and fetch for `user_id`. Anonymous stays `Loading`.
    pub async fn refresh(&self, user_id: Option<Uuid>) {
        refresh(self.backend.as_ref(), &self.state, user_id).await;
    }

    /// Re-fetch on every identity change published by `session`, starting now.
    pub fn follow(&mut self, session: SessionReader) {
        self.stop();
        let backend = self.backend.clone();
        let state = self.state.clone();
        self.follow_task = Some(tokio::spawn(follow_identity(backend, state, session)));
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.follow_task.take() {
            task.abort();
        }
    }
}

impl Drop for GalleryViewer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn load_view(backend: &dyn Backend, user_id: Uuid) -> Result<GalleryView, GalleryError> {
    let personal = tables::list_personal_images(backend, user_id).await?;
    let (mode, images) = if personal.is_empty() {
        (GalleryMode::Portfolio, tables::list_portfolio_images(backend).await?)
    } else {
        (GalleryMode::Personal, personal)
    };
    let items = images
        .into_iter()
        .map(|image| GalleryItem { url: backend.public_url(GALLERY_BUCKET, &image.file_path), image })
        .collect();
    Ok(GalleryView { mode, items })
}

async fn refresh(backend: &dyn Backend, state: &watch::Sender<GalleryState>, user_id: Option<Uuid>) {
    state.send_replace(GalleryState::Loading);
    let Some(user_id) = user_id else {
        return;
    };
    let view = match load_view(backend, user_id).await {
        Ok(view) => view,
        Err(e) => {
            error!(%user_id, error = %e, "error fetching images");
            GalleryView::empty()
        }
    };
    debug!(%user_id, mode = ?view.mode, count = view.items.len(), "gallery loaded");
    state.send_replace(GalleryState::Ready(view));
}

async fn follow_identity(
    backend: Arc<dyn Backend>,
    state: Arc<watch::Sender<GalleryState>>,
    mut session: SessionReader,
) {
    let mut current = session.user_id();
    refresh(backend.as_ref(), &state, current).await;
    while session.changed().await {
        let next = session.user_id();
        if next != current {
            current = next;
            refresh(backend.as_ref(), &state, current).await;
        }
    }
}

#[cfg(test)]
#[path = "gallery_test.rs"]
mod tests;
