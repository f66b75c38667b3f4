//! Rolling-window latency percentiles and error rate, keyed per
//! (chain, provider).
//!
//! Grounded on the teacher's own `latency` crate — same purpose, same
//! name space — generalized to the exact nearest-rank percentile spec.md
//! requires rather than an online approximate digest (see DESIGN.md for
//! why `watermill` was dropped).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use portable_atomic::AtomicU64;
use tracing::trace;

const DEFAULT_WINDOW: Duration = Duration::from_secs(300);

type Key = (Arc<str>, Arc<str>);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub total_errors: u64,
    pub error_rate: f64,
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
}

struct Record {
    at: std::time::Instant,
    latency: Duration,
    is_error: bool,
}

struct Entries {
    records: Vec<Record>,
}

impl Entries {
    fn prune(&mut self, window: Duration) {
        let cutoff = std::time::Instant::now().checked_sub(window);
        if let Some(cutoff) = cutoff {
            self.records.retain(|r| r.at >= cutoff);
        }
    }
}

pub struct MetricsStore {
    window: Duration,
    entries: Mutex<HashMap<Key, Entries>>,
    total_recorded: AtomicU64,
}

impl MetricsStore {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(HashMap::new()),
            total_recorded: AtomicU64::new(0),
        }
    }

    pub fn record_success(&self, chain: &str, provider: &str, latency: Duration) {
        self.record(chain, provider, latency, false);
    }

    pub fn record_error(&self, chain: &str, provider: &str, latency: Duration) {
        self.record(chain, provider, latency, true);
    }

    fn record(&self, chain: &str, provider: &str, latency: Duration, is_error: bool) {
        let key: Key = (Arc::from(chain), Arc::from(provider));
        let mut entries = self.entries.lock();
        let slot = entries.entry(key).or_insert_with(|| Entries { records: Vec::new() });
        slot.records.push(Record {
            at: std::time::Instant::now(),
            latency,
            is_error,
        });
        self.total_recorded.fetch_add(1, portable_atomic::Ordering::Relaxed);
        trace!(chain, provider, is_error, "recorded metrics sample");
    }

    /// Snapshot for one (chain, provider); `None` if no samples remain in
    /// the pruned window.
    pub fn snapshot(&self, chain: &str, provider: &str) -> Option<MetricsSnapshot> {
        let key: Key = (Arc::from(chain), Arc::from(provider));
        let mut entries = self.entries.lock();
        let slot = entries.get_mut(&key)?;
        slot.prune(self.window);
        Self::snapshot_from(&slot.records)
    }

    pub fn snapshot_all(&self) -> Vec<((Arc<str>, Arc<str>), MetricsSnapshot)> {
        let mut entries = self.entries.lock();
        let mut out = Vec::new();
        for (key, slot) in entries.iter_mut() {
            slot.prune(self.window);
            if let Some(snapshot) = Self::snapshot_from(&slot.records) {
                out.push((key.clone(), snapshot));
            }
        }
        out
    }

    pub fn total_recorded(&self) -> u64 {
        self.total_recorded.load(portable_atomic::Ordering::Relaxed)
    }

    fn snapshot_from(records: &[Record]) -> Option<MetricsSnapshot> {
        let n = records.len();
        if n == 0 {
            return None;
        }

        let mut latencies: Vec<Duration> = records.iter().map(|r| r.latency).collect();
        latencies.sort_unstable();

        let total_errors = records.iter().filter(|r| r.is_error).count() as u64;

        let percentile = |q: f64| -> Duration {
            let idx = (((n as f64) * q).ceil() as i64 - 1).max(0) as usize;
            latencies[idx.min(n - 1)]
        };

        Some(MetricsSnapshot {
            total_requests: n as u64,
            total_errors,
            error_rate: total_errors as f64 / n as f64,
            p50: percentile(0.50),
            p95: percentile(0.95),
            p99: percentile(0.99),
        })
    }
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}
