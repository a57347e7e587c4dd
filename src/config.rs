//! Backend configuration parsed from environment variables.

use std::path::PathBuf;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Bucket used by the single-file quick uploader.
pub const IMAGES_BUCKET: &str = "Images";
/// Bucket used by the admin panel and the gallery.
pub const GALLERY_BUCKET: &str = "gallery-images";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env var {var}")]
    Missing { var: &'static str },
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub request_secs: u64,
    pub connect_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self { request_secs: DEFAULT_REQUEST_TIMEOUT_SECS, connect_secs: DEFAULT_CONNECT_TIMEOUT_SECS }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// Project base URL, without trailing slash.
    pub url: String,
    /// Public (anon) API key sent with every request.
    pub anon_key: String,
    /// Where magic-link emails send the user back to.
    pub redirect_url: String,
    /// Optional file used to keep the session between runs.
    pub session_file: Option<PathBuf>,
    pub timeouts: Timeouts,
}

impl BackendConfig {
    /// Build a config with defaults for everything but the URL and key.
    #[must_use]
    pub fn new(url: &str, anon_key: &str) -> Self {
        let url = url.trim_end_matches('/').to_string();
        Self {
            redirect_url: url.clone(),
            url,
            anon_key: anon_key.to_string(),
            session_file: None,
            timeouts: Timeouts::default(),
        }
    }

    /// Build typed backend config from environment variables.
    ///
    /// Required:
    /// - `GALLERY_BACKEND_URL`
    /// - `GALLERY_ANON_KEY`
    ///
    /// Optional:
    /// - `GALLERY_REDIRECT_URL`: defaults to the backend URL
    /// - `GALLERY_SESSION_FILE`: session persistence disabled when absent
    /// - `GALLERY_REQUEST_TIMEOUT_SECS`: default 60
    /// - `GALLERY_CONNECT_TIMEOUT_SECS`: default 10
    ///
    /// # Errors
    ///
    /// Returns `Missing` for absent required vars and `Invalid` for a URL
    /// without an http(s) scheme.
    pub fn from_env() -> Result<Self, ConfigError> {
        let url = required("GALLERY_BACKEND_URL")?;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid { var: "GALLERY_BACKEND_URL", reason: format!("not an http(s) URL: {url}") });
        }
        let anon_key = required("GALLERY_ANON_KEY")?;

        let mut config = Self::new(&url, &anon_key);
        if let Some(redirect) = optional("GALLERY_REDIRECT_URL") {
            config.redirect_url = redirect;
        }
        config.session_file = optional("GALLERY_SESSION_FILE").map(PathBuf::from);
        config.timeouts = Timeouts {
            request_secs: env_parse_u64("GALLERY_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS),
            connect_secs: env_parse_u64("GALLERY_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS),
        };
        Ok(config)
    }
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    optional(var).ok_or(ConfigError::Missing { var })
}

fn optional(var: &str) -> Option<String> {
    std::env::var(var).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_parse_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
