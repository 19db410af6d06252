//! The adaptive monitor: a background control loop that waits for the
//! workload to stabilise, then hill-climbs `load_admit` to maximise
//! combined cache+core throughput, and resets on workload shift.
//!
//! Grounded exactly in `mf_monitor.c`: `monitor_wait_stable`,
//! `monitor_measure_throughput`, and `monitor_tune_load_admit`'s
//! three-point slope-following hill climb are ports of that file's
//! control flow, with the rwlock-pair admission state translated to
//! [`crate::admission::AdmissionState`] and the constants sourced from
//! [`crate::config::TunerConstants`] so tests can compress them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info};

use crate::admission::AdmissionState;
use crate::config::TunerConstants;
use crate::stats::EngineStats;
use crate::throughput_log::ThroughputLog;
use crate::worker::now_ms;

/// Below this committed `load_admit`, the client isn't saturating cache
/// bandwidth and classical caching (not spilling) is the right call.
const FULL_ADMIT: f64 = 1.0;

pub struct AdaptiveMonitor {
    admission: Arc<AdmissionState>,
    stats: Arc<EngineStats>,
    cache_log: Arc<ThroughputLog>,
    core_log: Arc<ThroughputLog>,
    tuner: TunerConstants,
    should_stop: Arc<AtomicBool>,
}

impl AdaptiveMonitor {
    pub fn new(
        admission: Arc<AdmissionState>,
        stats: Arc<EngineStats>,
        cache_log: Arc<ThroughputLog>,
        core_log: Arc<ThroughputLog>,
        tuner: TunerConstants,
    ) -> Self {
        AdaptiveMonitor {
            admission,
            stats,
            cache_log,
            core_log,
            tuner,
            should_stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn should_stop_handle(&self) -> Arc<AtomicBool> {
        self.should_stop.clone()
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("adaptive-monitor".into())
            .spawn(move || self.run())
            .expect("failed to spawn adaptive monitor thread")
    }

    pub fn stop(&self) {
        self.should_stop.store(true, Ordering::SeqCst);
    }

    fn stopping(&self) -> bool {
        self.should_stop.load(Ordering::SeqCst)
    }

    /// §4.4.5 main loop.
    fn run(&self) {
        while !self.stopping() {
            self.admission.set_data_admit(true);
            self.admission.set_load_admit(FULL_ADMIT);
            debug!("monitor entering FALLBACK");

            let base_miss_ratio = match self.wait_stable() {
                Some(b) => b,
                None => return,
            };

            self.admission.set_data_admit(false);
            info!(base_miss_ratio, "workload stable, tuning load_admit");
            self.tune_load_admit(base_miss_ratio);
        }
    }

    /// §4.4.2. Samples the read-miss ratio until two consecutive
    /// samples land within `wait_stable_threshold` of each other.
    fn wait_stable(&self) -> Option<f64> {
        let mut last = -0.1;
        loop {
            if self.stopping() {
                return None;
            }
            let current = self.stats.miss_ratio();
            if (current - last).abs() <= self.tuner.wait_stable_threshold {
                return Some(current);
            }
            last = current;
            std::thread::sleep(Duration::from_micros(self.tuner.wait_stable_sleep_interval_us));
        }
    }

    /// §4.4.3. Sets `load_admit`, waits one probe interval, and returns
    /// the combined cache+core throughput observed during that window.
    fn measure_throughput(&self, load_admit: f64) -> f64 {
        self.admission.set_load_admit(load_admit);
        std::thread::sleep(Duration::from_micros(self.tuner.measure_throughput_interval_us));
        let now = now_ms();
        let window_ms = self.tuner.measure_throughput_interval_us as f64 / 1000.0;
        self.cache_log.query_throughput(now - window_ms, now) + self.core_log.query_throughput(now - window_ms, now)
    }

    fn probe_or_edge(&self, candidate: f64) -> f64 {
        if !(0.0..=1.0).contains(&candidate) {
            -0.1
        } else {
            self.measure_throughput(candidate)
        }
    }

    /// §4.4.4. Three-point slope-following hill climb. Returns when the
    /// workload shifts or intensity collapses twice in a row.
    fn tune_load_admit(&self, base_miss_ratio: f64) {
        let step = self.tuner.load_admit_tuning_step;
        let mut second_chance_used = false;

        loop {
            if self.stopping() {
                return;
            }

            let mut la2 = self.admission.query_load_admit();
            let mut tp2 = self.measure_throughput(la2);
            let mut la3 = la2 + step;
            let mut tp3 = self.probe_or_edge(la3);
            let mut la1 = la2 - step;
            let mut tp1 = self.probe_or_edge(la1);
            self.admission.set_load_admit(la2);

            loop {
                if self.stopping() {
                    return;
                }

                let miss_ratio = self.stats.miss_ratio();
                if miss_ratio > base_miss_ratio + self.tuner.workload_change_threshold {
                    debug!(miss_ratio, base_miss_ratio, "workload shift detected, returning to FALLBACK");
                    return;
                }

                if tp2 >= tp3 && tp2 >= tp1 {
                    self.admission.set_load_admit(la2);
                    break;
                } else if tp3 >= tp2 && tp3 >= tp1 {
                    la1 = la2;
                    tp1 = tp2;
                    la2 = la3;
                    tp2 = tp3;
                    la3 += step;
                    if la3 >= 1.0 {
                        la3 = la3.min(1.0);
                        self.admission.set_load_admit(la2);
                        break;
                    }
                    tp3 = self.measure_throughput(la3);
                } else {
                    la3 = la2;
                    tp3 = tp2;
                    la2 = la1;
                    tp2 = tp1;
                    la1 -= step;
                    if la1 <= 0.0 {
                        la1 = la1.max(0.0);
                        self.admission.set_load_admit(la2);
                        break;
                    }
                    tp1 = self.measure_throughput(la1);
                }
            }

            if self.admission.query_load_admit() >= FULL_ADMIT {
                if second_chance_used {
                    debug!("intensity collapse confirmed, exiting tuning");
                    return;
                }
                second_chance_used = true;
                continue;
            }

            second_chance_used = false;
            info!(load_admit = self.admission.query_load_admit(), "hill climb committed");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_stable_converges_on_a_static_ratio() {
        let stats = EngineStats::new();
        for _ in 0..10 {
            stats.record_hit();
        }
        stats.record_miss();

        let monitor = AdaptiveMonitor::new(
            Arc::new(AdmissionState::new()),
            stats,
            Arc::new(ThroughputLog::new(16)),
            Arc::new(ThroughputLog::new(16)),
            TunerConstants::compressed(1000),
        );

        let base = monitor.wait_stable().expect("should converge");
        assert!((base - 1.0 / 11.0).abs() < 1e-9);
    }

    #[test]
    fn tune_load_admit_leaves_load_admit_in_bounds() {
        let admission = Arc::new(AdmissionState::new());
        let stats = EngineStats::new();
        stats.record_hit();
        let cache_log = Arc::new(ThroughputLog::new(16));
        let core_log = Arc::new(ThroughputLog::new(16));

        let monitor = AdaptiveMonitor::new(
            admission.clone(),
            stats,
            cache_log,
            core_log,
            TunerConstants::compressed(1000),
        );

        monitor.tune_load_admit(0.0);
        let la = admission.query_load_admit();
        assert!((0.0..=1.0).contains(&la));
    }

    #[test]
    fn stop_flag_halts_wait_stable_promptly() {
        let stats = EngineStats::new();
        // Alternate hit/miss so the ratio never settles.
        let monitor = Arc::new(AdaptiveMonitor::new(
            Arc::new(AdmissionState::new()),
            stats.clone(),
            Arc::new(ThroughputLog::new(16)),
            Arc::new(ThroughputLog::new(16)),
            TunerConstants::compressed(1),
        ));
        monitor.stop();
        assert!(monitor.wait_stable().is_none());
    }
}
