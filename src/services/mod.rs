//! Client workflows layered over the backend.
//!
//! ARCHITECTURE
//! ============
//! Each service owns its own state and talks to the backend directly.
//! The only state shared between them is the auth session, which
//! `session::SessionManager` writes and everything else reads through
//! `session::SessionReader`.

pub mod gallery;
pub mod quick_upload;
pub mod session;
pub mod upload;
