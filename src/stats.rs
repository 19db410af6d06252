//! Engine-wide counters and the periodic statistics reporter.
//!
//! Grounded in the teacher's `WorkerStats` (lock-free atomics, min/max
//! tracked via `compare_exchange_weak` loops) and `io/engine.rs`'s
//! monitoring thread / `BenchmarkResults` shape, extended with the
//! request-class counters spec'd for this engine (cache/core errors,
//! fallbacks, promotions, backfills).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use crate::throughput_log::ThroughputLog;

#[derive(Default)]
pub struct EngineStats {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub promotions: AtomicU64,
    pub backfills: AtomicU64,
    pub fallback_pt: AtomicU64,
    pub cache_errors: AtomicU64,
    pub core_errors: AtomicU64,
    pub ops_completed: AtomicU64,
    pub ops_failed: AtomicU64,
    pub latency_total_us: AtomicU64,
    pub latency_min_us: AtomicU64,
    pub latency_max_us: AtomicU64,
}

impl EngineStats {
    pub fn new() -> Arc<Self> {
        Arc::new(EngineStats {
            latency_min_us: AtomicU64::new(u64::MAX),
            ..Default::default()
        })
    }

    pub fn record_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backfill(&self) {
        self.backfills.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback_pt(&self) {
        self.fallback_pt.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_error(&self) {
        self.cache_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_core_error(&self) {
        self.core_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completion(&self, latency: Duration, ok: bool) {
        if ok {
            self.ops_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.ops_failed.fetch_add(1, Ordering::Relaxed);
        }

        let us = latency.as_micros() as u64;
        self.latency_total_us.fetch_add(us, Ordering::Relaxed);

        let mut current_min = self.latency_min_us.load(Ordering::Relaxed);
        while us < current_min {
            match self.latency_min_us.compare_exchange_weak(
                current_min,
                us,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(prev) => current_min = prev,
            }
        }

        let mut current_max = self.latency_max_us.load(Ordering::Relaxed);
        while us > current_max {
            match self.latency_max_us.compare_exchange_weak(
                current_max,
                us,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(prev) => current_max = prev,
            }
        }
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed) as f64;
        let misses = self.cache_misses.load(Ordering::Relaxed) as f64;
        if hits + misses == 0.0 {
            0.0
        } else {
            hits / (hits + misses)
        }
    }

    pub fn miss_ratio(&self) -> f64 {
        1.0 - self.hit_ratio()
    }
}

/// A point-in-time snapshot, mirroring the teacher's `BenchmarkResults`.
#[derive(Debug, Clone)]
pub struct BenchmarkReport {
    pub elapsed: Duration,
    pub cache_throughput_kbps: f64,
    pub core_throughput_kbps: f64,
    pub ops_completed: u64,
    pub ops_failed: u64,
    pub hit_ratio: f64,
    pub promotions: u64,
    pub backfills: u64,
    pub fallback_pt: u64,
    pub latency_min_us: u64,
    pub latency_avg_us: f64,
    pub latency_max_us: u64,
}

pub fn snapshot(
    stats: &EngineStats,
    cache_log: &ThroughputLog,
    core_log: &ThroughputLog,
    started_at: Instant,
    window_ms: f64,
) -> BenchmarkReport {
    let now = crate::worker::now_ms();
    let ops_completed = stats.ops_completed.load(Ordering::Relaxed);
    let latency_total = stats.latency_total_us.load(Ordering::Relaxed);
    let min = stats.latency_min_us.load(Ordering::Relaxed);

    BenchmarkReport {
        elapsed: started_at.elapsed(),
        cache_throughput_kbps: cache_log.query_throughput(now - window_ms, now),
        core_throughput_kbps: core_log.query_throughput(now - window_ms, now),
        ops_completed,
        ops_failed: stats.ops_failed.load(Ordering::Relaxed),
        hit_ratio: stats.hit_ratio(),
        promotions: stats.promotions.load(Ordering::Relaxed),
        backfills: stats.backfills.load(Ordering::Relaxed),
        fallback_pt: stats.fallback_pt.load(Ordering::Relaxed),
        latency_min_us: if min == u64::MAX { 0 } else { min },
        latency_avg_us: if ops_completed == 0 {
            0.0
        } else {
            latency_total as f64 / ops_completed as f64
        },
        latency_max_us: stats.latency_max_us.load(Ordering::Relaxed),
    }
}

/// Periodic human-readable reporter; runs until `should_stop` is set.
pub struct StatsReporter {
    handle: Option<std::thread::JoinHandle<()>>,
    should_stop: Arc<std::sync::atomic::AtomicBool>,
}

impl StatsReporter {
    pub fn spawn(
        stats: Arc<EngineStats>,
        cache_log: Arc<ThroughputLog>,
        core_log: Arc<ThroughputLog>,
        interval: Duration,
    ) -> Self {
        let should_stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let stop_flag = should_stop.clone();
        let started_at = Instant::now();

        let handle = std::thread::Builder::new()
            .name("stats-reporter".into())
            .spawn(move || {
                while !stop_flag.load(Ordering::Relaxed) {
                    std::thread::sleep(interval);
                    let report = snapshot(&stats, &cache_log, &core_log, started_at, interval.as_millis() as f64);
                    info!(
                        cache_kbps = report.cache_throughput_kbps,
                        core_kbps = report.core_throughput_kbps,
                        hit_ratio = report.hit_ratio,
                        ops = report.ops_completed,
                        "benchmark report"
                    );
                }
            })
            .expect("failed to spawn stats reporter thread");

        StatsReporter {
            handle: Some(handle),
            should_stop,
        }
    }

    pub fn stop(mut self) {
        self.should_stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_ratio_with_no_samples_is_zero() {
        let stats = EngineStats::new();
        assert_eq!(stats.hit_ratio(), 0.0);
    }

    #[test]
    fn hit_ratio_tracks_hits_and_misses() {
        let stats = EngineStats::new();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        assert!((stats.hit_ratio() - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn completion_counters_never_decrease() {
        let stats = EngineStats::new();
        stats.record_completion(Duration::from_micros(100), true);
        let first = stats.ops_completed.load(Ordering::Relaxed);
        stats.record_completion(Duration::from_micros(50), true);
        let second = stats.ops_completed.load(Ordering::Relaxed);
        assert!(second >= first);
        assert_eq!(stats.latency_min_us.load(Ordering::Relaxed), 50);
        assert_eq!(stats.latency_max_us.load(Ordering::Relaxed), 100);
    }
}
