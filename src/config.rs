use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Selects which read/write function pair an engine instance installs.
///
/// `Pt|Wa|Wb|Wt` are classical, non-multi-factor routes. `Mfwa|Mfwb|Mfwt`
/// install the full multi-factor read path and differ only in the base
/// write policy they delegate to (and, for `Mfwb`, the dirty-hit rule).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    Pt,
    Wa,
    Wb,
    Wt,
    Mfwa,
    Mfwb,
    Mfwt,
}

impl CacheMode {
    pub fn is_multi_factor(self) -> bool {
        matches!(self, CacheMode::Mfwa | CacheMode::Mfwb | CacheMode::Mfwt)
    }

    pub fn all() -> &'static [CacheMode] {
        &[
            CacheMode::Pt,
            CacheMode::Wa,
            CacheMode::Wb,
            CacheMode::Wt,
            CacheMode::Mfwa,
            CacheMode::Mfwb,
            CacheMode::Mfwt,
        ]
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CacheMode::Pt => "pt",
            CacheMode::Wa => "wa",
            CacheMode::Wb => "wb",
            CacheMode::Wt => "wt",
            CacheMode::Mfwa => "mfwa",
            CacheMode::Mfwb => "mfwb",
            CacheMode::Mfwt => "mfwt",
        };
        f.write_str(s)
    }
}

impl FromStr for CacheMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pt" => Ok(CacheMode::Pt),
            "wa" => Ok(CacheMode::Wa),
            "wb" => Ok(CacheMode::Wb),
            "wt" => Ok(CacheMode::Wt),
            "mfwa" => Ok(CacheMode::Mfwa),
            "mfwb" => Ok(CacheMode::Mfwb),
            "mfwt" => Ok(CacheMode::Mfwt),
            other => Err(format!(
                "unknown cache mode '{other}' (expected one of: pt, wa, wb, wt, mfwa, mfwb, mfwt)"
            )),
        }
    }
}

/// I/O direction on the wire protocol to a simulated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    pub fn as_wire_u32(self) -> u32 {
        match self {
            Direction::Read => 0,
            Direction::Write => 1,
        }
    }
}

/// Tunable constants driving the adaptive monitor's control loop.
///
/// Defaulted to the literal values of the design, but overridable so
/// tests can run the monitor on a compressed timescale.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TunerConstants {
    pub wait_stable_threshold: f64,
    pub wait_stable_sleep_interval_us: u64,
    pub workload_change_threshold: f64,
    pub load_admit_tuning_step: f64,
    pub measure_throughput_interval_us: u64,
    pub log_capacity: usize,
}

impl Default for TunerConstants {
    fn default() -> Self {
        TunerConstants {
            wait_stable_threshold: 0.0015,
            wait_stable_sleep_interval_us: 100_000,
            workload_change_threshold: 0.2,
            load_admit_tuning_step: 0.01,
            measure_throughput_interval_us: 25_000,
            log_capacity: 120_000,
        }
    }
}

impl TunerConstants {
    /// Scales every time-based constant down by `factor`, for fast tests.
    /// Ratio-based constants (thresholds, step) are left untouched.
    pub fn compressed(factor: u64) -> Self {
        let base = TunerConstants::default();
        TunerConstants {
            wait_stable_sleep_interval_us: (base.wait_stable_sleep_interval_us / factor).max(1),
            measure_throughput_interval_us: (base.measure_throughput_interval_us / factor).max(1),
            ..base
        }
    }
}

/// Static run configuration: device paths, block size, concurrency, and
/// the cache mode under test. Mirrors the split between a static `Config`
/// and the live-adjustable `TunerConstants` the monitor mutates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub cache_mode: CacheMode,
    pub cache_socket_path: String,
    pub core_socket_path: String,
    pub block_size: u32,
    pub queue_depth: u32,
    pub worker_threads: usize,
    pub duration_secs: u64,
    pub enable_monitor: bool,
    /// Whether the wire protocol actually transfers `size` bytes of
    /// payload, or just exchanges headers/latency (faster for tests
    /// that only care about counts and timing).
    pub transfer_data: bool,
    pub tuner: TunerConstants,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_mode: CacheMode::Mfwa,
            cache_socket_path: "/tmp/mf-cache-sim-cache.sock".to_string(),
            core_socket_path: "/tmp/mf-cache-sim-core.sock".to_string(),
            block_size: 4096,
            queue_depth: 32,
            worker_threads: num_cpus::get(),
            duration_secs: 30,
            enable_monitor: true,
            transfer_data: true,
            tuner: TunerConstants::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_mode_round_trips_through_display_and_from_str() {
        for mode in CacheMode::all() {
            let parsed: CacheMode = mode.to_string().parse().unwrap();
            assert_eq!(parsed, *mode);
        }
    }

    #[test]
    fn cache_mode_rejects_unknown_string() {
        assert!("bogus".parse::<CacheMode>().is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let cfg = Config::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.cache_mode, cfg.cache_mode);
        assert_eq!(back.block_size, cfg.block_size);
        assert_eq!(back.tuner.wait_stable_threshold, cfg.tuner.wait_stable_threshold);
    }
}
