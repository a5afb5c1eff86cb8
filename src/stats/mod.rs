//! Hit/byte accounting (spec.md §4.8): a root aggregate plus one aggregate
//! per sub-cluster, each independently rolling hour/day/month/year buckets
//! and persisting to disk once a minute.

pub mod access_log;
pub mod aggregator;
pub mod persistence;

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::RwLock;

pub use aggregator::{Counter, StatData};

const STATS_FILE_NAME: &str = "stat.json";
const STATS_SUBDIR: &str = "stats";

/// Owns the root [`StatData`] plus one per sub-cluster, keyed by cluster
/// id, matching `original_source/notify/stat.go:Stats`'s `subStat` map.
pub struct StatsAggregator {
    root: RwLock<StatData>,
    sub: RwLock<HashMap<String, StatData>>,
    data_dir: PathBuf,
}

impl StatsAggregator {
    /// An empty aggregator rooted at `data_dir`; does not touch disk.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: RwLock::new(StatData::default()),
            sub: RwLock::new(HashMap::new()),
            data_dir: data_dir.into(),
        }
    }

    /// Load persisted state from `data_dir`, recovering from `.old`
    /// generations as needed. Missing files are treated as empty state,
    /// not an error (first run).
    pub async fn load(data_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let data_dir = data_dir.into();
        let root = persistence::load_or_recover::<StatData>(&data_dir.join(STATS_FILE_NAME))
            .await?
            .unwrap_or_default();

        let mut sub = HashMap::new();
        let stats_dir = data_dir.join(STATS_SUBDIR);
        if let Ok(mut entries) = tokio::fs::read_dir(&stats_dir).await {
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_dir() {
                    continue;
                }
                let file_name = entry.file_name();
                let file_name = file_name.to_string_lossy();
                if let Some(id) = file_name.strip_suffix(".json") {
                    if id.ends_with(".old") {
                        continue;
                    }
                    let data = persistence::load_or_recover::<StatData>(&entry.path())
                        .await?
                        .unwrap_or_default();
                    sub.insert(id.to_string(), data);
                }
            }
        }

        Ok(Self {
            root: RwLock::new(root),
            sub: RwLock::new(sub),
            data_dir,
        })
    }

    /// Record `hits`/`bytes` against the root aggregate and, if
    /// `sub_cluster` is non-empty, against its own aggregate too
    /// (`notify/stat.go:AddHits`).
    pub fn record_hit(&self, hits: u64, bytes: u64, sub_cluster: &str) {
        let counter = Counter { hits, bytes };
        self.root.write().record(counter);
        if !sub_cluster.is_empty() {
            self.sub
                .write()
                .entry(sub_cluster.to_string())
                .or_default()
                .record(counter);
        }
    }

    /// Fold a batch of per-UA request counts (already canonicalized) into
    /// the root aggregate's `accesses` map.
    pub fn record_ua_accesses(&self, counts: HashMap<String, u64>) {
        let mut root = self.root.write();
        for (ua, n) in counts {
            *root.accesses.entry(ua).or_insert(0) += n;
        }
    }

    /// Snapshot and persist both the root and every sub-cluster aggregate.
    pub async fn persist(&self) -> std::io::Result<()> {
        let root_snapshot = self.root.read().clone();
        let sub_snapshot: HashMap<String, StatData> = self.sub.read().clone();

        persistence::write_with_old(&self.data_dir.join(STATS_FILE_NAME), &root_snapshot).await?;

        let stats_dir = self.data_dir.join(STATS_SUBDIR);
        tokio::fs::create_dir_all(&stats_dir).await?;
        for (name, data) in &sub_snapshot {
            let path = stats_dir.join(format!("{name}.json"));
            persistence::write_with_old(&path, data).await?;
        }
        Ok(())
    }

    /// Spawn a ticker that persists to disk every minute until the handle
    /// is dropped.
    pub fn spawn_persistence_loop(self: std::sync::Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                ticker.tick().await;
                if let Err(e) = self.persist().await {
                    tracing::warn!(error = %e, "failed to persist stats");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_dir() -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("edgecache-stats-test-{}", uuid::Uuid::new_v4()));
        p
    }

    #[tokio::test]
    async fn records_hit_against_root_and_subcluster() {
        let agg = StatsAggregator::new(data_dir());
        agg.record_hit(1, 100, "sub-a");
        agg.record_hit(1, 50, "");
        assert_eq!(agg.root.read().current.hours.iter().map(|c| c.hits).sum::<u64>(), 2);
        assert_eq!(
            agg.sub.read().get("sub-a").unwrap().current.hours.iter().map(|c| c.hits).sum::<u64>(),
            1
        );
    }

    #[tokio::test]
    async fn persist_then_load_round_trips() {
        let dir = data_dir();
        let agg = StatsAggregator::new(&dir);
        agg.record_hit(3, 900, "sub-a");
        agg.persist().await.unwrap();

        let reloaded = StatsAggregator::load(&dir).await.unwrap();
        assert_eq!(
            reloaded.root.read().current.hours.iter().map(|c| c.hits).sum::<u64>(),
            3
        );
        assert!(reloaded.sub.read().contains_key("sub-a"));
    }

    #[tokio::test]
    async fn load_with_no_existing_files_is_empty() {
        let reloaded = StatsAggregator::load(data_dir()).await.unwrap();
        assert!(reloaded.sub.read().is_empty());
    }
}
