//! Reference filesystem-backed [`Storage`] implementation.
//!
//! Out of scope per spec.md §1 ("concrete storage backends ... behind a
//! uniform Storage interface" are external collaborators) beyond a single
//! reference backend needed to exercise the rest of the agent end to end.
//! Layout follows `original_source/utils/util.go:WalkCacheDir`: objects
//! live at `<root>/<hash[..2]>/<hash>`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{ServeOutcome, Storage, StorageError, StorageResult};

/// Serves files from a local directory, sharded two hex chars deep.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Create a backend rooted at `root`, creating the directory if needed.
    pub async fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn path_for(&self, hash: &str) -> PathBuf {
        let shard = if hash.len() >= 2 { &hash[..2] } else { hash };
        self.root.join(shard).join(hash)
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn serve(
        &self,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
        hash: &str,
        size: u64,
    ) -> StorageResult<ServeOutcome> {
        let path = self.path_for(hash);
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotServed)
            }
            Err(e) => return Err(StorageError::Io(e.to_string())),
        };
        let mut buf = vec![0u8; 64 * 1024];
        let mut written: u64 = 0;
        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| StorageError::Io(e.to_string()))?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buf[..n])
                .await
                .map_err(|e| StorageError::Io(e.to_string()))?;
            written += n as u64;
        }
        let _ = size; // size is informational; the file on disk is authoritative.
        Ok(ServeOutcome::Served { bytes: written })
    }

    async fn put(&self, hash: &str, data: &[u8]) -> StorageResult<()> {
        let path = self.path_for(hash);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    async fn remove(&self, hash: &str) -> StorageResult<()> {
        let path = self.path_for(hash);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e.to_string())),
        }
    }

    async fn measure(
        &self,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
        size_mb: u32,
    ) -> StorageResult<ServeOutcome> {
        const CHUNK: usize = 64 * 1024;
        let chunk = vec![0u8; CHUNK];
        let total = size_mb as u64 * 1024 * 1024;
        let mut remaining = total;
        while remaining > 0 {
            let n = remaining.min(CHUNK as u64) as usize;
            writer
                .write_all(&chunk[..n])
                .await
                .map_err(|e| StorageError::Io(e.to_string()))?;
            remaining -= n as u64;
        }
        Ok(ServeOutcome::Served { bytes: total })
    }

    fn flavor(&self) -> &str {
        "local"
    }
}

/// Walk every object under `root`'s shard directories, yielding
/// `(hash, size)` pairs — used to seed a fileset from what's already on
/// disk (`original_source/utils/util.go:WalkCacheDir`).
pub async fn walk_cache_dir(root: &Path) -> std::io::Result<Vec<(String, u64)>> {
    let mut out = Vec::new();
    let mut shards = tokio::fs::read_dir(root).await?;
    while let Some(shard) = shards.next_entry().await? {
        if !shard.file_type().await?.is_dir() {
            continue;
        }
        let shard_name = shard.file_name();
        let shard_name = shard_name.to_string_lossy();
        let mut entries = tokio::fs::read_dir(shard.path()).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.len() >= 2 && name.starts_with(shard_name.as_ref()) {
                let size = entry.metadata().await?.len();
                out.push((name.to_string(), size));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_serve_round_trips() {
        let dir = tempdir();
        let storage = LocalStorage::new(&dir).await.unwrap();
        let hash = "d41d8cd98f00b204e9800998ecf8427e";
        storage.put(hash, b"hello world").await.unwrap();

        let mut out = Vec::new();
        let outcome = storage.serve(&mut out, hash, 11).await.unwrap();
        match outcome {
            ServeOutcome::Served { bytes } => assert_eq!(bytes, 11),
            _ => panic!("expected Served outcome"),
        }
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn serve_missing_hash_is_not_served() {
        let dir = tempdir();
        let storage = LocalStorage::new(&dir).await.unwrap();
        let mut out = Vec::new();
        let err = storage
            .serve(&mut out, "0000000000000000000000000000000000000000", 0)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotServed));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = tempdir();
        let storage = LocalStorage::new(&dir).await.unwrap();
        storage.remove("nonexistent").await.unwrap();
    }

    #[tokio::test]
    async fn measure_writes_exact_byte_count() {
        let dir = tempdir();
        let storage = LocalStorage::new(&dir).await.unwrap();
        let mut out = Vec::new();
        storage.measure(&mut out, 1).await.unwrap();
        assert_eq!(out.len(), 1024 * 1024);
    }

    fn tempdir() -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("edgecache-local-test-{}", uuid::Uuid::new_v4()));
        p
    }
}
