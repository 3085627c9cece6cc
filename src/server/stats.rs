//! Monotone request counters plus a running mean latency, reported
//! periodically and on shutdown via `tracing::info!`.
//!
//! Kept deliberately plain — an atomics struct and a print loop — rather
//! than the teacher's axum/utoipa HTTP stats API: the spec calls only for a
//! human-readable log line, not an admin surface.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Default)]
pub struct Stats {
    total_requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    bytes_served: AtomicU64,
    // Fixed-point mean response time in microseconds, plus a sample count,
    // updated together under the running-mean formula from the spec.
    mean_latency_us: AtomicU64,
    latency_samples: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
    pub total_requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub bytes_served: u64,
    pub mean_latency_ms: f64,
}

impl Stats {
    pub fn record_hit(&self, bytes: u64, latency: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.bytes_served.fetch_add(bytes, Ordering::Relaxed);
        self.record_latency(latency);
    }

    pub fn record_miss(&self, bytes: u64, latency: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.bytes_served.fetch_add(bytes, Ordering::Relaxed);
        self.record_latency(latency);
    }

    /// Record a request that ended on an error path (bad request, unsupported
    /// method, upstream failure, admission rejection) rather than a cache hit
    /// or miss. Counts toward `total_requests` and the mean latency, but not
    /// `hits`/`misses`/`bytes_served`.
    pub fn record_error(&self, latency: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
    }

    fn record_latency(&self, latency: Duration) {
        // mean <- (mean * n + sample) / (n + 1); losing the occasional race
        // to interleaving updates is acceptable for a statistics display.
        let sample_us = latency.as_micros() as u64;
        let n = self.latency_samples.fetch_add(1, Ordering::Relaxed);
        let prev_mean = self.mean_latency_us.load(Ordering::Relaxed);
        let new_mean = (prev_mean * n + sample_us) / (n + 1);
        self.mean_latency_us.store(new_mean, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bytes_served: self.bytes_served.load(Ordering::Relaxed),
            mean_latency_ms: self.mean_latency_us.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }
}

impl Snapshot {
    fn report_line(&self, cache_bytes: u64) -> String {
        let hit_pct = percentage(self.hits, self.total_requests);
        let miss_pct = percentage(self.misses, self.total_requests);
        format!(
            "requests={} hits={} ({:.1}%) misses={} ({:.1}%) bytes_served={:.2}MiB mean_latency={:.2}ms cache_size={:.2}MiB",
            self.total_requests,
            self.hits,
            hit_pct,
            self.misses,
            miss_pct,
            self.bytes_served as f64 / (1024.0 * 1024.0),
            self.mean_latency_ms,
            cache_bytes as f64 / (1024.0 * 1024.0),
        )
    }
}

fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (part as f64 / total as f64) * 100.0
    }
}

/// Spawn the periodic reporter; it exits when `shutdown` is cancelled, after
/// emitting one final report.
pub fn spawn_reporter(
    stats: std::sync::Arc<Stats>,
    cache: std::sync::Arc<crate::cache::LruCache>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    info!("{}", stats.snapshot().report_line(cache.total_bytes()));
                }
                _ = shutdown.cancelled() => {
                    info!("{}", stats.snapshot().report_line(cache.total_bytes()));
                    break;
                }
            }
        }
    })
}
