//! Admin-curated image gallery client for a hosted backend.
//!
//! Authentication, object storage, and rows all live on the hosted
//! platform; this crate provides the typed contract (`backend`), its HTTP
//! binding, and the session, upload, and gallery workflows on top.

pub mod backend;
pub mod config;
pub mod models;
pub mod services;
pub mod tables;
