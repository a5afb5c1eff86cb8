//! Durable warm-start cache for the coordinator's file-list response
//! (config surface `cache.type{no|memory|redis}`, spec.md §6).
//!
//! This is not a request/response HTTP cache for the client-facing
//! surface (the dashboard/API that would front is out of scope per
//! spec.md §1) — it exists so [`crate::manifest_sync::ManifestSync`] can
//! seed its in-memory fileset from the last successfully fetched file
//! list immediately on startup, before the first coordinator round trip
//! completes, rather than serving nothing until that first sync lands.

use async_trait::async_trait;

use crate::config::{CacheConfig, CacheType};

/// Backend for [`ManifestSync`](crate::manifest_sync::ManifestSync)'s
/// warm-start cache. Implementations must tolerate a miss identically to
/// an empty cache — this is a performance/availability aid, never a
/// source of truth.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<Vec<u8>>;
    async fn set(&self, key: &str, value: Vec<u8>);
}

/// `cache.type: no` — every lookup misses, every store is discarded.
pub struct NoCache;

#[async_trait]
impl ResponseCache for NoCache {
    async fn get(&self, _key: &str) -> Option<Vec<u8>> {
        None
    }

    async fn set(&self, _key: &str, _value: Vec<u8>) {}
}

/// `cache.type: memory` — process-local, lost on restart (which is
/// exactly when the warm-start cache matters most; kept mainly so
/// single-process tests and deployments without Redis still exercise the
/// same code path as `redis`).
pub struct MemoryCache {
    entries: tokio::sync::RwLock<std::collections::HashMap<String, Vec<u8>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: tokio::sync::RwLock::new(std::collections::HashMap::new()),
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResponseCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.read().await.get(key).cloned()
    }

    async fn set(&self, key: &str, value: Vec<u8>) {
        self.entries.write().await.insert(key.to_string(), value);
    }
}

/// `cache.type: redis` — survives a node restart, so a freshly started
/// process can warm-start its fileset from the last list any node in the
/// fleet fetched, rather than serving nothing until the first sync lands.
pub struct RedisCache {
    conn: tokio::sync::Mutex<redis::aio::ConnectionManager>,
}

impl RedisCache {
    pub async fn connect(url: &str) -> redis::RedisResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_tokio_connection_manager().await?;
        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
        })
    }
}

#[async_trait]
impl ResponseCache for RedisCache {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        use redis::AsyncCommands;
        let mut conn = self.conn.lock().await;
        match conn.get::<_, Option<Vec<u8>>>(key).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "redis cache get failed, treating as miss");
                None
            }
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) {
        use redis::AsyncCommands;
        let mut conn = self.conn.lock().await;
        if let Err(e) = conn.set::<_, _, ()>(key, value).await {
            tracing::warn!(error = %e, "redis cache set failed, continuing without it");
        }
    }
}

/// Build the configured cache backend. A `redis` config with an
/// unreachable server degrades to [`NoCache`] rather than failing
/// startup — this cache is an optimization, never load-bearing.
pub async fn build(config: &CacheConfig) -> std::sync::Arc<dyn ResponseCache> {
    match config.kind {
        CacheType::No => std::sync::Arc::new(NoCache),
        CacheType::Memory => std::sync::Arc::new(MemoryCache::new()),
        CacheType::Redis => {
            let url = config.redis_url.as_deref().unwrap_or_default();
            match RedisCache::connect(url).await {
                Ok(cache) => std::sync::Arc::new(cache),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to connect to redis, falling back to no-op cache");
                    std::sync::Arc::new(NoCache)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_cache_always_misses() {
        let cache = NoCache;
        cache.set("k", vec![1, 2, 3]).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn memory_cache_round_trips() {
        let cache = MemoryCache::new();
        cache.set("k", vec![1, 2, 3]).await;
        assert_eq!(cache.get("k").await, Some(vec![1, 2, 3]));
        assert_eq!(cache.get("missing").await, None);
    }
}
