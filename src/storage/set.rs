//! [`StorageSet`]: an ordered, weighted collection of [`Storage`] backends
//! served as one (spec.md §3, §4.2).
//!
//! Selection order for `serve`/`measure` is the weighted-random-start walk
//! from [`super::weighted`] so load spreads across backends roughly
//! proportional to their configured weight, while every backend — including
//! weight-0 ones — still gets a turn if earlier candidates decline.

use std::sync::Arc;

use super::{weighted::for_each_from_random_index, ServeOutcome, Storage, StorageError, StorageResult};

/// One configured backend plus the id/weight it was registered under.
pub struct StorageEntry {
    pub id: String,
    pub weight: u32,
    pub backend: Arc<dyn Storage>,
}

/// A weighted fan-out across one or more [`Storage`] backends.
pub struct StorageSet {
    entries: Vec<StorageEntry>,
}

impl StorageSet {
    pub fn new(entries: Vec<StorageEntry>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_weight(&self) -> u64 {
        self.entries.iter().map(|e| e.weight as u64).sum()
    }

    fn weights(&self) -> Vec<u32> {
        self.entries.iter().map(|e| e.weight).collect()
    }

    /// Indices into `self.entries` in the order they should be tried, per a
    /// single weighted-random-start draw.
    fn visit_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.entries.len());
        for_each_from_random_index(&self.weights(), |i| {
            order.push(i);
            false
        });
        order
    }

    /// Try backends in weighted order until one serves `hash`, or every
    /// candidate declines.
    pub async fn serve(
        &self,
        writer: &mut (dyn tokio::io::AsyncWrite + Send + Unpin),
        hash: &str,
        size: u64,
    ) -> StorageResult<ServeOutcome> {
        if self.entries.is_empty() {
            return Err(StorageError::Unavailable("no storage backends configured".into()));
        }
        let mut last_err = StorageError::NotServed;
        for idx in self.visit_order() {
            match self.entries[idx].backend.serve(writer, hash, size).await {
                Ok(outcome) => return Ok(outcome),
                Err(StorageError::NotServed) => {
                    last_err = StorageError::NotServed;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    /// Same weighted selection as `serve`, for the bandwidth-probe endpoint.
    pub async fn measure(
        &self,
        writer: &mut (dyn tokio::io::AsyncWrite + Send + Unpin),
        size_mb: u32,
    ) -> StorageResult<ServeOutcome> {
        if self.entries.is_empty() {
            return Err(StorageError::Unavailable("no storage backends configured".into()));
        }
        let mut last_err = StorageError::NotServed;
        for idx in self.visit_order() {
            match self.entries[idx].backend.measure(writer, size_mb).await {
                Ok(outcome) => return Ok(outcome),
                Err(StorageError::NotServed) => {
                    last_err = StorageError::NotServed;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    /// Persist to every backend in parallel (manifest sync writes
    /// everywhere, not just the weighted pick — every configured backend
    /// must end up holding every file; a single backend's failure fails
    /// the whole fetch, spec.md §4.3 step 4).
    pub async fn put_everywhere(&self, hash: &str, data: &[u8]) -> StorageResult<()> {
        let puts = self
            .entries
            .iter()
            .map(|entry| async move { (entry.id.as_str(), entry.backend.put(hash, data).await) });
        let results = futures::future::join_all(puts).await;

        let mut first_err = None;
        for (id, result) in results {
            if let Err(e) = result {
                tracing::warn!(backend = %id, hash, error = %e, "failed to persist to backend");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Remove `hash` from every backend, ignoring per-backend "didn't have
    /// it" outcomes (hash-mismatch eviction needs to be thorough, not
    /// weighted).
    pub async fn remove_everywhere(&self, hash: &str) -> StorageResult<()> {
        let mut first_err = None;
        for entry in &self.entries {
            if let Err(e) = entry.backend.remove(hash).await {
                tracing::warn!(backend = %entry.id, hash, error = %e, "failed to remove from backend");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Declarative description for the `enable` handshake's `flavor.storage`
    /// field, e.g. `"local"` or `"local+webdav"`.
    pub fn flavor(&self) -> String {
        self.entries
            .iter()
            .map(|e| e.backend.flavor())
            .collect::<Vec<_>>()
            .join("+")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::local::LocalStorage;

    async fn backend(id: &str, weight: u32) -> StorageEntry {
        let mut dir = std::env::temp_dir();
        dir.push(format!("edgecache-set-test-{}", uuid::Uuid::new_v4()));
        StorageEntry {
            id: id.to_string(),
            weight,
            backend: Arc::new(LocalStorage::new(dir).await.unwrap()),
        }
    }

    #[tokio::test]
    async fn serve_finds_hash_on_whichever_backend_has_it() {
        let a = backend("a", 50).await;
        let b = backend("b", 50).await;
        let hash = "5d41402abc4b2a76b9719d911017c592";
        b.backend.put(hash, b"hello").await.unwrap();

        let set = StorageSet::new(vec![a, b]);
        let mut out = Vec::new();
        let outcome = set.serve(&mut out, hash, 5).await.unwrap();
        match outcome {
            ServeOutcome::Served { bytes } => assert_eq!(bytes, 5),
            _ => panic!("expected Served"),
        }
    }

    #[tokio::test]
    async fn serve_errors_when_no_backend_has_it() {
        let a = backend("a", 100).await;
        let set = StorageSet::new(vec![a]);
        let mut out = Vec::new();
        let err = set.serve(&mut out, "deadbeef", 0).await.unwrap_err();
        assert!(matches!(err, StorageError::NotServed));
    }

    #[tokio::test]
    async fn put_everywhere_reaches_every_backend() {
        let a = backend("a", 1).await;
        let b = backend("b", 1).await;
        let a_backend = Arc::clone(&a.backend);
        let b_backend = Arc::clone(&b.backend);
        let set = StorageSet::new(vec![a, b]);

        let hash = "5d41402abc4b2a76b9719d911017c592";
        set.put_everywhere(hash, b"hello").await.unwrap();

        let mut out_a = Vec::new();
        a_backend.serve(&mut out_a, hash, 5).await.unwrap();
        let mut out_b = Vec::new();
        b_backend.serve(&mut out_b, hash, 5).await.unwrap();
        assert_eq!(out_a, b"hello");
        assert_eq!(out_b, b"hello");
    }

    #[tokio::test]
    async fn flavor_joins_backend_flavors() {
        let a = backend("a", 1).await;
        let b = backend("b", 1).await;
        let set = StorageSet::new(vec![a, b]);
        assert_eq!(set.flavor(), "local+local");
    }

    #[tokio::test]
    async fn total_weight_sums_entries() {
        let a = backend("a", 30).await;
        let b = backend("b", 70).await;
        let set = StorageSet::new(vec![a, b]);
        assert_eq!(set.total_weight(), 100);
    }
}
