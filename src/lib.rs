//! Wakegate - A transparent reverse proxy that starts its backend on demand
//!
//! This library provides a single-backend reverse proxy that:
//! - Launches the backend process on the first request (and again after it exits)
//! - Forwards every request verbatim, rewriting only the `Host` header
//! - Follows backend redirects that stay on the backend's own origin
//! - Relays the backend's status, headers and body back unchanged
//! - Answers with JSON errors when the backend cannot be reached

pub mod config;
pub mod error;
pub mod forward;
pub mod proxy;
pub mod relay;
pub mod supervisor;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
