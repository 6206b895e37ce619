//! Switchgate - a gateway that runs one backend app at a time
//!
//! This library provides a single-host reverse proxy that:
//! - Fronts a set of named apps, selected per request by a query parameter
//! - Keeps at most one backend process alive, cold-switching on demand
//! - Serializes switches through one worker and rejects stale ones
//! - Tags buffered responses with a content-hash ETag and answers 304s
//! - Tunnels WebSocket upgrades straight to the active backend
//! - Serves the app list over `/api/config` for live replacement

pub mod config;
pub mod config_api;
pub mod control;
pub mod error;
pub mod manager;
pub mod pool;
pub mod proxy;
pub mod readiness;

/// Package name from Cargo.toml
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Package version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
