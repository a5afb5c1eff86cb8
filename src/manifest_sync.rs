//! [`ManifestSync`]: pulls the authoritative file list from the
//! coordinator, diffs it against the local fileset, and fills gaps through
//! [`DownloadCoalescer`] (spec.md §4.4).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::auth::AuthTokenCache;
use crate::cache::ResponseCache;
use crate::coalescer::{CoalesceError, CoalesceResult, DownloadCoalescer};
use crate::storage::StorageSet;

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Error, Debug, Clone)]
pub enum SyncError {
    #[error("coordinator file list request failed: {0}")]
    ListRequest(String),
    #[error("malformed file list response: {0}")]
    ListShape(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

/// One entry in the coordinator's authoritative file list.
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct FileRecord {
    pub path: String,
    pub hash: String,
    pub size: u64,
    #[serde(default)]
    pub mtime: i64,
}

/// Pulls the coordinator's file list and drives fetches for anything
/// missing locally. Holds the in-memory fileset snapshot that
/// [`crate::router`] reads from on every download request.
pub struct ManifestSync {
    http: reqwest::Client,
    origin_base: String,
    auth: Arc<AuthTokenCache>,
    storage: Arc<StorageSet>,
    coalescer: Arc<DownloadCoalescer>,
    cache: Arc<dyn ResponseCache>,
    cache_key: String,
    fileset: RwLock<HashMap<String, u64>>,
    last_list_mod: AtomicI64,
    issync: AtomicBool,
    sync_progress: AtomicU64,
    sync_total: AtomicU64,
    download_max_conn: usize,
}

impl ManifestSync {
    pub fn new(
        http: reqwest::Client,
        origin_base: impl Into<String>,
        auth: Arc<AuthTokenCache>,
        storage: Arc<StorageSet>,
        coalescer: Arc<DownloadCoalescer>,
        cache: Arc<dyn ResponseCache>,
        cluster_id: &str,
        download_max_conn: usize,
    ) -> Self {
        Self {
            http,
            origin_base: origin_base.into().trim_end_matches('/').to_string(),
            auth,
            storage,
            coalescer,
            cache,
            cache_key: format!("filelist:{cluster_id}"),
            fileset: RwLock::new(HashMap::new()),
            last_list_mod: AtomicI64::new(0),
            issync: AtomicBool::new(false),
            sync_progress: AtomicU64::new(0),
            sync_total: AtomicU64::new(0),
            download_max_conn: download_max_conn.max(1),
        }
    }

    /// Seed the in-memory fileset from the last cached file list, if any,
    /// so the node can serve known hashes immediately after a restart
    /// rather than waiting for the first coordinator round trip to land
    /// (spec.md §6 `cache.type` surface, see `crate::cache`).
    ///
    /// Does not touch `last_list_mod`: the next [`ManifestSync::sync`]
    /// still performs a full conditional GET against the coordinator,
    /// which is the authoritative source of truth.
    pub async fn warm_start(&self) {
        let Some(raw) = self.cache.get(&self.cache_key).await else {
            return;
        };
        let records: Vec<FileRecord> = match serde_json::from_slice(&raw) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "discarding unparseable warm-start cache entry");
                return;
            }
        };
        let count = records.len();
        let mut fileset = self.fileset.write().await;
        for record in records {
            fileset.entry(record.hash).or_insert(record.size);
        }
        tracing::info!(count, "warm-started fileset from cache");
    }

    /// Size of `hash` if it's in the current fileset.
    pub async fn size_of(&self, hash: &str) -> Option<u64> {
        self.fileset.read().await.get(hash).copied()
    }

    /// Whether `hash` is known to the current fileset.
    pub async fn contains(&self, hash: &str) -> bool {
        self.fileset.read().await.contains_key(hash)
    }

    pub fn progress(&self) -> (u64, u64) {
        (
            self.sync_progress.load(Ordering::Relaxed),
            self.sync_total.load(Ordering::Relaxed),
        )
    }

    /// Fetch a single hash outside the regular sync cycle — used when a
    /// download request misses the fileset (spec.md §4.7).
    pub async fn force_fetch(&self, hash: &str) -> CoalesceResult<u64> {
        let bytes = self.coalescer.fetch(hash).await?;
        self.fileset.write().await.insert(hash.to_string(), bytes);
        Ok(bytes)
    }

    /// Run one sync cycle. A second call while one is already in flight is
    /// a no-op (single-writer gate, spec.md §5 "Ordering guarantees").
    pub async fn sync(&self) -> SyncResult<()> {
        if self
            .issync
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("sync already in progress, skipping");
            return Ok(());
        }
        let result = self.run_sync().await;
        self.issync.store(false, Ordering::SeqCst);
        result
    }

    async fn run_sync(&self) -> SyncResult<()> {
        let last_mod = self.last_list_mod.load(Ordering::SeqCst);
        let token = self
            .auth
            .get_token()
            .await
            .map_err(|e| SyncError::ListRequest(e.to_string()))?;

        let url = format!(
            "{}/openbmclapi/files?lastModified={}",
            self.origin_base, last_mod
        );
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&token.jwt)
            .send()
            .await
            .map_err(|e| SyncError::ListRequest(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_MODIFIED {
            return Ok(());
        }
        if !resp.status().is_success() {
            return Err(SyncError::ListRequest(format!("HTTP {}", resp.status())));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| SyncError::ListRequest(e.to_string()))?;
        let records: Vec<FileRecord> =
            serde_json::from_slice(&body).map_err(|e| SyncError::ListShape(e.to_string()))?;
        self.cache.set(&self.cache_key, body.to_vec()).await;

        let mut to_fetch: Vec<&FileRecord> = {
            let fileset = self.fileset.read().await;
            records
                .iter()
                .filter(|r| !fileset.contains_key(&r.hash))
                .collect()
        };
        to_fetch.sort_by(|a, b| b.size.cmp(&a.size));

        self.sync_total.store(to_fetch.len() as u64, Ordering::SeqCst);
        self.sync_progress.store(0, Ordering::SeqCst);

        let concurrency = self.download_max_conn;
        stream::iter(to_fetch.into_iter().cloned())
            .for_each_concurrent(concurrency, |record| {
                let coalescer = Arc::clone(&self.coalescer);
                let storage = Arc::clone(&self.storage);
                let progress = &self.sync_progress;
                async move {
                    fetch_with_retry(&coalescer, &storage, &record.hash).await;
                    progress.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;

        let new_mod = records.iter().map(|r| r.mtime).max().unwrap_or(last_mod);
        let new_fileset: HashMap<String, u64> =
            records.into_iter().map(|r| (r.hash, r.size)).collect();

        *self.fileset.write().await = new_fileset;
        self.last_list_mod.store(new_mod, Ordering::SeqCst);

        Ok(())
    }
}

/// Fetch `hash` with up to [`MAX_RETRIES`] attempts and exponential
/// backoff. A digest mismatch is not retried: the bad copy is evicted from
/// every backend and the sync moves on (spec.md §4.4 step 6 — "not
/// fatal").
async fn fetch_with_retry(coalescer: &DownloadCoalescer, storage: &StorageSet, hash: &str) {
    let mut backoff = INITIAL_BACKOFF;
    for attempt in 0..MAX_RETRIES {
        match coalescer.fetch(hash).await {
            Ok(_) => return,
            Err(CoalesceError::DigestMismatch { hash }) => {
                if let Err(e) = storage.remove_everywhere(&hash).await {
                    tracing::warn!(hash, error = %e, "failed to evict mismatched hash");
                }
                tracing::warn!(hash, "origin hash mismatch, evicted");
                return;
            }
            Err(e) => {
                if attempt + 1 == MAX_RETRIES {
                    tracing::warn!(hash, error = %e, "giving up on file after retries");
                    return;
                }
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ClusterIdentity;
    use crate::storage::local::LocalStorage;
    use crate::storage::set::StorageEntry;

    fn identity() -> ClusterIdentity {
        ClusterIdentity {
            id: "node-1".into(),
            secret: "s3cr3t".into(),
            host: "127.0.0.1".into(),
            public_port: 8080,
            public_hosts: vec!["cdn.example".into()],
            byoc: false,
            prefix: "http://127.0.0.1:0".into(),
        }
    }

    async fn manifest_sync() -> ManifestSync {
        let http = reqwest::Client::new();
        let auth = Arc::new(AuthTokenCache::new(http.clone(), &identity()));
        let mut dir = std::env::temp_dir();
        dir.push(format!("edgecache-sync-test-{}", uuid::Uuid::new_v4()));
        let backend = LocalStorage::new(dir).await.unwrap();
        let storage = Arc::new(StorageSet::new(vec![StorageEntry {
            id: "a".into(),
            weight: 1,
            backend: Arc::new(backend),
        }]));
        let coalescer = Arc::new(DownloadCoalescer::new(
            http.clone(),
            "http://127.0.0.1:9",
            Arc::clone(&auth),
            Arc::clone(&storage),
        ));
        let cache: Arc<dyn ResponseCache> = Arc::new(crate::cache::MemoryCache::new());
        ManifestSync::new(
            http,
            "http://127.0.0.1:9",
            auth,
            storage,
            coalescer,
            cache,
            "node-1",
            4,
        )
    }

    #[tokio::test]
    async fn warm_start_seeds_fileset_from_cache() {
        let sync = manifest_sync().await;
        let records = vec![FileRecord {
            path: "a.txt".into(),
            hash: "deadbeef".into(),
            size: 42,
            mtime: 0,
        }];
        sync.cache
            .set(&sync.cache_key, serde_json::to_vec(&records).unwrap())
            .await;
        sync.warm_start().await;
        assert_eq!(sync.size_of("deadbeef").await, Some(42));
    }

    #[tokio::test]
    async fn warm_start_with_no_cached_entry_is_a_no_op() {
        let sync = manifest_sync().await;
        sync.warm_start().await;
        assert_eq!(sync.size_of("deadbeef").await, None);
    }

    #[tokio::test]
    async fn size_of_unknown_hash_is_none() {
        let sync = manifest_sync().await;
        assert_eq!(sync.size_of("deadbeef").await, None);
    }

    #[tokio::test]
    async fn second_sync_call_is_a_no_op_while_first_in_flight() {
        let sync = Arc::new(manifest_sync().await);
        sync.issync.store(true, Ordering::SeqCst);
        let result = sync.sync().await;
        assert!(result.is_ok());
        // issync was not touched by the no-op path.
        assert!(sync.issync.load(Ordering::SeqCst));
        sync.issync.store(false, Ordering::SeqCst);
    }
}
