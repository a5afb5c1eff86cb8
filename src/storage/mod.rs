//! Storage backend contract (spec.md §4.2, design note "Storage
//! polymorphism").
//!
//! The contract is intentionally small and closed, mirroring the teacher's
//! `enterprise::cache` tier abstractions but trait-object based rather than
//! generic, since the set of implementations is closed per spec.md (Local,
//! Mount, WebDAV) and callers hold a homogeneous `Vec<Arc<dyn Storage>>`.

pub mod local;
pub mod set;
pub mod weighted;

use async_trait::async_trait;
use thiserror::Error;

pub use set::StorageSet;

/// Errors a storage backend can surface. `NotServed` is not really an
/// error — it signals "this backend declines, try the next candidate"
/// (spec.md §4.2: "a backend must signal not served before writing
/// headers").
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("backend declined to serve, try next candidate")]
    NotServed,
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// The outcome of successfully serving or measuring through a backend.
pub enum ServeOutcome {
    /// The backend wants the client redirected (e.g. to a signed OSS URL).
    Redirect { location: String },
    /// The backend streamed the object itself; `bytes` is what it wrote.
    Served { bytes: u64 },
}

/// Capability interface each backend implements (spec.md §4.2).
#[async_trait]
pub trait Storage: Send + Sync {
    /// Serve `hash` (known to be `size` bytes) to `writer`. Implementations
    /// must not commit to `writer` (write status/headers) unless they are
    /// certain they can complete the response — on any doubt, return
    /// [`StorageError::NotServed`] so [`StorageSet::serve`] can try the next
    /// candidate without having corrupted the response.
    async fn serve(
        &self,
        writer: &mut (dyn tokio::io::AsyncWrite + Send + Unpin),
        hash: &str,
        size: u64,
    ) -> StorageResult<ServeOutcome>;

    /// Persist `data` (already verified against `hash`) to this backend.
    async fn put(&self, hash: &str, data: &[u8]) -> StorageResult<()>;

    /// Remove `hash` from this backend (called on hash-mismatch eviction).
    async fn remove(&self, hash: &str) -> StorageResult<()>;

    /// Serve `size_mb` MiB of deterministic content for the `/measure`
    /// bandwidth-probe endpoint.
    async fn measure(
        &self,
        writer: &mut (dyn tokio::io::AsyncWrite + Send + Unpin),
        size_mb: u32,
    ) -> StorageResult<ServeOutcome>;

    /// Declarative description used in the `enable` handshake's
    /// `flavor.storage` field (e.g. `"local"`, `"mount+webdav"`).
    fn flavor(&self) -> &str;
}
