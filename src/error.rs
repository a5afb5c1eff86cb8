//! Crate-wide error types.
//!
//! Each subsystem gets its own flat error enum (mirroring
//! `enterprise::cluster::ClusterError` / `enterprise::auth::jwt::JwtError` in
//! spirit: a handful of named variants, a `#[from]` where a lower layer's
//! error is simply wrapped, and a `pub type XResult<T>` alias next to it).
//! [`AgentError`] is the top-level union the state machine and driver speak.

use thiserror::Error;

use crate::auth::token_cache::AuthError;
use crate::coalescer::CoalesceError;
use crate::manifest_sync::SyncError;
use crate::session::SessionError;
use crate::storage::StorageError;

/// Errors surfaced to the top-level agent driver.
///
/// The driver (see [`crate::agent`]) is the error locus described in
/// spec.md §7: it is the only place that decides whether an error is
/// retriable, should trigger a reconnect, or is fatal and should become a
/// process exit code.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Failed to obtain or refresh a bearer token from the coordinator.
    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    /// The coordinator control session misbehaved or dropped.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// A storage backend failed in a way that isn't simply "try the next one".
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Manifest sync failed sync-wide (not a single-file failure).
    #[error("manifest sync error: {0}")]
    Sync(#[from] SyncError),

    /// Download coalescing failed for a requested hash.
    #[error("download error: {0}")]
    Download(#[from] CoalesceError),

    /// The coordinator acked a keep-alive with `false`: the node is kicked.
    #[error("kicked by coordinator")]
    Kicked,

    /// A malformed ack payload shape; treated as a disable + reconnect.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A fatal configuration problem detected at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Local I/O failure (data directory, hmac key, stats files).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for [`AgentError`].
pub type AgentResult<T> = Result<T, AgentError>;
