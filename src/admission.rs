//! Process-wide admission switches.
//!
//! Grounded in `mf_monitor.c`'s `global_data_admit`/`global_load_admit`
//! pair, each guarded by its own rwlock: readers vastly outnumber
//! writers (every cache read touches both), and the monitor is the
//! only writer.

use parking_lot::RwLock;
use rand::Rng;

/// The two switches a multi-factor read engine consults once per
/// request: whether a promoting miss is allowed, and the probability
/// that a hit is served from cache rather than spilled to core.
pub struct AdmissionState {
    data_admit: RwLock<bool>,
    load_admit: RwLock<f64>,
}

impl AdmissionState {
    /// Initial state: FALLBACK, i.e. promote everything, serve every hit
    /// from cache.
    pub fn new() -> Self {
        AdmissionState {
            data_admit: RwLock::new(true),
            load_admit: RwLock::new(1.0),
        }
    }

    pub fn query_data_admit(&self) -> bool {
        *self.data_admit.read()
    }

    pub fn query_load_admit(&self) -> f64 {
        *self.load_admit.read()
    }

    pub fn set_data_admit(&self, value: bool) {
        *self.data_admit.write() = value;
    }

    pub fn set_load_admit(&self, value: f64) {
        *self.load_admit.write() = value;
    }

    /// Samples whether a hit should be served from cache under the
    /// current `load_admit` probability: `uniform(0,1) <= load_admit`.
    pub fn sample_load_admit_allowed(&self) -> bool {
        let load_admit = self.query_load_admit();
        rand::thread_rng().gen::<f64>() <= load_admit
    }
}

impl Default for AdmissionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_fallback() {
        let a = AdmissionState::new();
        assert!(a.query_data_admit());
        assert_eq!(a.query_load_admit(), 1.0);
    }

    #[test]
    fn load_admit_zero_never_admits() {
        let a = AdmissionState::new();
        a.set_load_admit(0.0);
        for _ in 0..1000 {
            assert!(!a.sample_load_admit_allowed());
        }
    }

    #[test]
    fn load_admit_one_always_admits() {
        let a = AdmissionState::new();
        a.set_load_admit(1.0);
        for _ in 0..1000 {
            assert!(a.sample_load_admit_allowed());
        }
    }

    #[test]
    fn set_and_query_round_trip() {
        let a = AdmissionState::new();
        a.set_data_admit(false);
        assert!(!a.query_data_admit());
        a.set_load_admit(0.42);
        assert_eq!(a.query_load_admit(), 0.42);
    }
}
