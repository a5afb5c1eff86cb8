//! Federated edge-cache node: coordinator control session, manifest
//! synchronization, and signed client-facing download serving.
//!
//! `agent` is the top-level driver; everything else is a narrowly-scoped
//! subsystem it wires together. See `DESIGN.md` for how each module maps
//! back to the production agent this crate is modeled on.

pub mod agent;
pub mod auth;
pub mod cache;
pub mod coalescer;
pub mod config;
pub mod error;
pub mod exitcode;
pub mod hashes;
pub mod identity;
pub mod manifest_sync;
pub mod router;
pub mod session;
pub mod stats;
pub mod storage;

/// Crate version, advertised in the `enable` handshake's `flavor` and the
/// `X-Powered-By` response header.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
