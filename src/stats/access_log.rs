//! Batches per-request access info (bytes served, latency, User-Agent) and
//! folds per-UA counts into [`super::StatsAggregator`] once a minute
//! instead of touching its lock on every request (spec.md §4.8 supplement;
//! ported in spirit from `handler.go:createRecordMiddleWare`'s ticker loop).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::aggregator::canonicalize_ua;
use super::StatsAggregator;

const CHANNEL_CAPACITY: usize = 1024;
const FLUSH_INTERVAL: Duration = Duration::from_secs(60);

struct AccessRecord {
    used_secs: f64,
    bytes: u64,
    ua: String,
    skip_ua: bool,
}

/// Handle request handlers submit access records to without blocking; a
/// full channel silently drops the record rather than apply backpressure
/// to the request path (the original's non-blocking channel send).
#[derive(Clone)]
pub struct AccessLogger {
    tx: mpsc::Sender<AccessRecord>,
}

impl AccessLogger {
    /// Spawn the background aggregation task and return a handle to it.
    pub fn spawn(stats: Arc<StatsAggregator>) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(run(rx, stats));
        Self { tx }
    }

    /// Submit one completed request's access info. `ua` is canonicalized
    /// here so the aggregation loop only ever deals with bucket keys.
    pub fn submit(&self, used_secs: f64, bytes: u64, ua: &str, skip_ua: bool) {
        let record = AccessRecord {
            used_secs,
            bytes,
            ua: canonicalize_ua(ua),
            skip_ua,
        };
        let _ = self.tx.try_send(record);
    }
}

async fn run(mut rx: mpsc::Receiver<AccessRecord>, stats: Arc<StatsAggregator>) {
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    let mut total_requests = 0u64;
    let mut total_used = 0.0f64;
    let mut total_bytes = 0u64;
    let mut uas: HashMap<String, u64> = HashMap::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                tracing::info!(
                    total_requests,
                    total_bytes,
                    total_used_secs = total_used,
                    "access log summary for the last minute",
                );
                if !uas.is_empty() {
                    stats.record_ua_accesses(std::mem::take(&mut uas));
                }
                total_requests = 0;
                total_used = 0.0;
                total_bytes = 0;
            }
            record = rx.recv() => {
                let Some(record) = record else { break };
                total_requests += 1;
                total_used += record.used_secs;
                total_bytes += record.bytes;
                if !record.skip_ua {
                    *uas.entry(record.ua).or_insert(0) += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn data_dir() -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("edgecache-access-log-test-{}", uuid::Uuid::new_v4()));
        p
    }

    #[tokio::test]
    async fn submit_does_not_block_even_past_capacity() {
        let stats = Arc::new(StatsAggregator::new(data_dir()));
        let logger = AccessLogger::spawn(stats);
        for _ in 0..CHANNEL_CAPACITY + 10 {
            logger.submit(0.01, 100, "rust-client/1.0", false);
        }
    }
}
