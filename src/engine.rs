//! The multi-factor read engine (MFWA / MFWB / MFWT), plus the four
//! classical dispatch targets (PT / WA / WB / WT) that round out the
//! cache-mode table.
//!
//! Grounded in `engine_mfwa.c`: `ocf_read_mfwa` is [`ReadEngine::read`],
//! `_ocf_read_mfwa_do` is [`ReadEngine::route`], and the two-completion
//! core-submission split (`_ocf_read_mfwa_to_core_cmpl_do_promote` /
//! `..._no_promote`) is reproduced in [`ReadEngine::on_core_done`]. The
//! classical modes reuse the same read path with both switches pinned
//! (`data_admit=true`, `load_admit=1.0`), matching §4.3.7's dispatch
//! table; MFWB additionally applies the dirty-hit-always-serves-cache
//! rule from `engine_mfwb.h`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::admission::AdmissionState;
use crate::config::{CacheMode, Direction};
use crate::error::EngineError;
use crate::mapping::{MappingLayer, PrepareOutcome};
use crate::request::{Completion, Request};
use crate::stats::EngineStats;
use crate::worker::DeviceWorker;

pub struct ReadEngine {
    mode: CacheMode,
    mapping: Arc<MappingLayer>,
    admission: Arc<AdmissionState>,
    stats: Arc<EngineStats>,
    cache_worker: Arc<DeviceWorker>,
    core_worker: Arc<DeviceWorker>,
    /// Mirrors `cache->pending_read_misses_list_blocked`: an external
    /// signal that forces every read to degrade to pass-through.
    pending_misses_blocked: Arc<AtomicBool>,
}

impl ReadEngine {
    pub fn new(
        mode: CacheMode,
        mapping: Arc<MappingLayer>,
        admission: Arc<AdmissionState>,
        stats: Arc<EngineStats>,
        cache_worker: Arc<DeviceWorker>,
        core_worker: Arc<DeviceWorker>,
    ) -> Arc<Self> {
        Arc::new(ReadEngine {
            mode,
            mapping,
            admission,
            stats,
            cache_worker,
            core_worker,
            pending_misses_blocked: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    pub fn pending_misses_blocked_handle(&self) -> Arc<AtomicBool> {
        self.pending_misses_blocked.clone()
    }

    /// §4.3.1 entry.
    pub fn read(self: &Arc<Self>, addr: u64, byte_length: u32, completion: Completion) {
        if self.mode == CacheMode::Pt {
            self.stats.record_fallback_pt();
            self.pass_through(addr, byte_length, completion);
            return;
        }

        if self.pending_misses_blocked.load(Ordering::Acquire) {
            debug!(addr, "pending read-misses blocked, passing through");
            self.pass_through(addr, byte_length, completion);
            return;
        }

        let (data_admit_allowed, load_admit_allowed) = if self.mode.is_multi_factor() {
            (
                self.admission.query_data_admit(),
                self.admission.sample_load_admit_allowed(),
            )
        } else {
            // Classical WA/WB/WT: promote every miss, never spill a hit.
            (true, true)
        };

        let req = Arc::new(Request::with_decisions(
            Direction::Read,
            addr,
            byte_length,
            data_admit_allowed,
            load_admit_allowed,
            completion,
        ));

        match self.mapping.prepare(addr, load_admit_allowed, data_admit_allowed) {
            PrepareOutcome::Error(err) => {
                debug!(addr, error = %err, "mapping error, clearing and falling back to PT");
                req.unlock();
                self.pass_through_req(req);
            }
            PrepareOutcome::Acquired(info) => {
                {
                    let mut m = req.mapping.lock().unwrap();
                    m.line_id = info.line_id;
                    m.hit = info.hit;
                    m.dirty_any = info.dirty_any;
                    m.rd_locked = info.rd_locked;
                }
                req.set_lock(info.lock);
                // This request actually touched the mapping layer, so a
                // later core error has metadata to roll back.
                req.cache_managed.store(true, Ordering::Release);
                self.route(req);
            }
        }
    }

    /// §4.3.3 `do(R)`.
    fn route(self: &Arc<Self>, req: Arc<Request>) {
        let (line_id, hit, dirty_any, rd_locked, re_part) = {
            let m = req.mapping.lock().unwrap();
            (m.line_id, m.hit, m.dirty_any, m.rd_locked, m.re_part)
        };

        // Re-partitioning is never triggered by this crate's mapping
        // layer (no partition-rebalancing policy is modeled), so this
        // branch is structurally present but never exercised — kept for
        // interface fidelity with the dispatch table.
        if re_part {
            self.mapping.hash_lock_wr(line_id, |_| {});
            self.mapping.part_move(line_id);
        }

        if hit {
            // MFWB: a dirty line's hit bypasses `load_admit` and always
            // serves from cache, since spilling a dirty hit to core
            // would read stale data. Eviction isn't modeled here, so
            // this override needs no extra lock beyond the hit/dirty
            // read already performed by `prepare`.
            let force_cache = self.mode == CacheMode::Mfwb && dirty_any;
            self.stats.record_hit();
            if req.load_admit_allowed || force_cache {
                self.submit_to_cache(req);
            } else {
                self.submit_to_core(req, false);
            }
            return;
        }

        self.stats.record_miss();
        if req.data_admit_allowed {
            if rd_locked {
                debug!(addr = req.addr, "rd_locked on miss, switching to PT");
                req.unlock();
                self.pass_through_req(req);
                return;
            }

            if dirty_any {
                // Should not normally occur outside MFWB; handled
                // defensively per the design notes' assertion target.
                debug_assert!(
                    self.mode == CacheMode::Mfwb,
                    "dirty miss under data_admit outside MFWB"
                );
                warn!(addr = req.addr, "dirty miss under data_admit, cleaning and dropping");
                self.mapping.hash_lock_rd(line_id, |_| {});
                self.mapping.clean(line_id);
                req.unlock();
                return;
            }

            self.mapping.hash_lock_rd(line_id, |_| {});
            self.mapping.set_valid_map_info(line_id);
            self.submit_to_core(req, true);
        } else {
            self.submit_to_core(req, false);
        }
    }

    /// §4.3.4.
    fn submit_to_cache(self: &Arc<Self>, req: Arc<Request>) {
        let io_count = self.mapping.io_count();
        req.set_remaining(io_count);

        for _ in 0..io_count {
            let engine = Arc::clone(self);
            let req2 = Arc::clone(&req);
            self.cache_worker.submit(
                Direction::Read,
                req.addr,
                req.byte_length,
                Box::new(move |result| engine.on_cache_done(req2, result)),
            );
        }
    }

    fn on_cache_done(self: &Arc<Self>, req: Arc<Request>, result: Result<(), EngineError>) {
        if let Err(e) = result {
            req.record_error(e);
        }
        if !req.decrement_is_last() {
            return;
        }

        if req.has_error() {
            req.take_error();
            self.stats.record_cache_error();
            self.stats.record_fallback_pt();
            req.unlock();
            // Retry via pass-through on the same request: the cache-side
            // lock and mapping state have already been fully unwound
            // above, so no partial cache-path state leaks into the PT
            // retry.
            self.submit_to_core(req, false);
        } else {
            req.unlock();
            req.complete(Ok(()));
        }
    }

    /// §4.3.5.
    fn submit_to_core(self: &Arc<Self>, req: Arc<Request>, promote: bool) {
        req.set_remaining(1);

        if promote {
            // `ctx_data_alloc` + `ctx_data_mlock` in the source: allocate
            // a promotion buffer and pin it so it can't be paged out from
            // under the later backfill write.
            let buf = vec![0u8; req.byte_length as usize];
            let mlock_rc = unsafe { libc::mlock(buf.as_ptr() as *const libc::c_void, buf.len()) };
            if mlock_rc != 0 {
                // Synthesise the NO_MEM completion the source produces on
                // allocation/mlock failure, without submitting any I/O.
                self.on_core_done(req, Err(EngineError::NoMemory), true);
                return;
            }
            *req.promotion_buf.lock().unwrap() = Some(buf);
        }

        let engine = Arc::clone(self);
        let req2 = Arc::clone(&req);
        self.core_worker.submit(
            Direction::Read,
            req.addr,
            req.byte_length,
            Box::new(move |result| engine.on_core_done(req2, result, promote)),
        );
    }

    /// Frees (and `munlock`s) a promoted request's buffer, if any.
    fn free_promotion_buf(req: &Request) {
        if let Some(buf) = req.promotion_buf.lock().unwrap().take() {
            unsafe {
                libc::munlock(buf.as_ptr() as *const libc::c_void, buf.len());
            }
        }
    }

    fn on_core_done(self: &Arc<Self>, req: Arc<Request>, result: Result<(), EngineError>, promote: bool) {
        if let Err(e) = result {
            req.record_error(e);
        }
        if !req.decrement_is_last() {
            return;
        }

        if req.has_error() {
            let err = req.take_error().expect("error flag set implies an error was recorded");
            req.core_error.store(true, Ordering::Release);
            req.unlock();
            req.complete(Err(err));

            self.stats.record_core_error();
            if promote {
                Self::free_promotion_buf(&req);
            }
            if req.cache_managed.load(Ordering::Acquire) {
                let line_id = req.mapping.lock().unwrap().line_id;
                self.mapping.invalidate(line_id);
            }
            return;
        }

        req.unlock();
        if promote {
            // The just-read data would be copied into the promotion
            // buffer here; this crate doesn't model payload bytes, so
            // the zero-filled buffer allocated in `submit_to_core`
            // already stands in for it.
            req.complete(Ok(()));
            self.stats.record_promotion();
            self.schedule_backfill(req);
        } else {
            req.complete(Ok(()));
        }
    }

    /// Consumes the promotion buffer and writes it to the cache line,
    /// then frees the buffer and drops `req`'s last reference.
    fn schedule_backfill(self: &Arc<Self>, req: Arc<Request>) {
        let engine = Arc::clone(self);
        let line_id = req.mapping.lock().unwrap().line_id;

        self.cache_worker.submit(
            Direction::Write,
            req.addr,
            req.byte_length,
            Box::new(move |result| {
                match result {
                    Ok(()) => {
                        engine.mapping.backfill(line_id);
                        engine.stats.record_backfill();
                    }
                    Err(e) => warn!(line_id, error = %e, "backfill write failed, line left invalid"),
                }
                Self::free_promotion_buf(&req);
                // `req`'s `Arc` is dropped here, its last reference.
            }),
        );
    }

    /// Entry-level bypass: no mapping was consulted, nothing to roll
    /// back regardless of outcome.
    fn pass_through(self: &Arc<Self>, addr: u64, byte_length: u32, completion: Completion) {
        let req = Arc::new(Request::with_decisions(
            Direction::Read,
            addr,
            byte_length,
            false,
            false,
            completion,
        ));
        self.submit_to_core(req, false);
    }

    /// Mapping-error recovery: reuses the already-constructed request
    /// (and its completion), but never touched cache metadata.
    fn pass_through_req(self: &Arc<Self>, req: Arc<Request>) {
        self.stats.record_fallback_pt();
        self.submit_to_core(req, false);
    }

    /// Delegates a write to the base policy installed for this mode.
    /// Writes are out of scope for deep design (§1 Non-goals); these are
    /// thin, visibly distinct routes so the `{read, write}` dispatch
    /// pair is total.
    pub fn write(self: &Arc<Self>, addr: u64, byte_length: u32, completion: Completion) {
        let req = Arc::new(Request::with_decisions(
            Direction::Write,
            addr,
            byte_length,
            false,
            false,
            completion,
        ));

        match self.mode {
            CacheMode::Pt => self.write_around(req),
            CacheMode::Wa | CacheMode::Mfwa => self.write_around(req),
            CacheMode::Wb | CacheMode::Mfwb => self.write_back(req),
            CacheMode::Wt | CacheMode::Mfwt => self.write_through(req),
        }
    }

    fn write_around(self: &Arc<Self>, req: Arc<Request>) {
        let line_id = self.mapping.line_id(req.addr);
        self.mapping.invalidate(line_id);
        req.set_remaining(1);

        self.core_worker.submit(
            Direction::Write,
            req.addr,
            req.byte_length,
            Box::new(move |result| complete_write_leg(req, result)),
        );
    }

    fn write_back(self: &Arc<Self>, req: Arc<Request>) {
        let line_id = self.mapping.line_id(req.addr);
        req.set_remaining(1);
        self.mapping.mark_dirty(line_id);
        self.mapping.set_valid_map_info(line_id);

        self.cache_worker.submit(
            Direction::Write,
            req.addr,
            req.byte_length,
            Box::new(move |result| complete_write_leg(req, result)),
        );
    }

    fn write_through(self: &Arc<Self>, req: Arc<Request>) {
        let line_id = self.mapping.line_id(req.addr);
        req.set_remaining(2);
        self.mapping.set_valid_map_info(line_id);

        let req_cache = Arc::clone(&req);
        self.cache_worker.submit(
            Direction::Write,
            req.addr,
            req.byte_length,
            Box::new(move |result| complete_write_leg(req_cache, result)),
        );

        self.core_worker.submit(
            Direction::Write,
            req.addr,
            req.byte_length,
            Box::new(move |result| complete_write_leg(req, result)),
        );
    }
}

/// Shared "last decrementer completes" tail for the classical write
/// routes, which (unlike reads) have only one completion shape.
fn complete_write_leg(req: Arc<Request>, result: Result<(), EngineError>) {
    if let Err(e) = result {
        req.record_error(e);
    }
    if req.decrement_is_last() {
        let outcome = match req.take_error() {
            Some(e) => Err(e),
            None => Ok(()),
        };
        req.complete(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{fixed_latency, SimServer, SimVolumeClient};
    use std::sync::mpsc;
    use std::time::Duration;

    struct Harness {
        engine: Arc<ReadEngine>,
        admission: Arc<AdmissionState>,
        stats: Arc<EngineStats>,
        cache_worker: Arc<DeviceWorker>,
        core_worker: Arc<DeviceWorker>,
        _cache_server: SimServer,
        _core_server: SimServer,
    }

    fn build_harness(mode: CacheMode) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let cache_sock = dir.path().join("cache.sock");
        let core_sock = dir.path().join("core.sock");

        let cache_server = SimServer::start(&cache_sock, false, fixed_latency(0)).unwrap();
        let core_server = SimServer::start(&core_sock, false, fixed_latency(0)).unwrap();

        let cache_client = Arc::new(SimVolumeClient::connect(cache_sock.to_str().unwrap(), false).unwrap());
        let core_client = Arc::new(SimVolumeClient::connect(core_sock.to_str().unwrap(), false).unwrap());

        let cache_log = Arc::new(crate::throughput_log::ThroughputLog::new(1024));
        let core_log = Arc::new(crate::throughput_log::ThroughputLog::new(1024));

        let cache_worker = Arc::new(DeviceWorker::spawn("cache", cache_client, cache_log));
        let core_worker = Arc::new(DeviceWorker::spawn("core", core_client, core_log));

        let mapping = Arc::new(MappingLayer::new(4096, 4));
        let admission = Arc::new(AdmissionState::new());
        let stats = EngineStats::new();

        let engine = ReadEngine::new(
            mode,
            mapping,
            admission.clone(),
            stats.clone(),
            cache_worker.clone(),
            core_worker.clone(),
        );

        Harness {
            engine,
            admission,
            stats,
            cache_worker,
            core_worker,
            _cache_server: cache_server,
            _core_server: core_server,
        }
    }

    fn read_blocking(engine: &Arc<ReadEngine>, addr: u64) -> Result<(), EngineError> {
        let (tx, rx) = mpsc::channel();
        engine.read(
            addr,
            4096,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx.recv_timeout(Duration::from_secs(2)).expect("completion")
    }

    #[test]
    fn s1_load_admit_zero_spills_every_hit_to_core() {
        let h = build_harness(CacheMode::Mfwa);
        h.admission.set_data_admit(true);
        h.admission.set_load_admit(0.0);

        // Warm every line first under full admission so every line is a
        // hit for the measured phase.
        h.admission.set_load_admit(1.0);
        for i in 0..50u64 {
            read_blocking(&h.engine, i * 4096).unwrap();
        }
        // Backfill runs asynchronously after the warm-up completion;
        // give it time to land before the measured phase.
        std::thread::sleep(Duration::from_millis(200));
        let core_after_warmup = h.core_worker.ios_submitted();
        let cache_after_warmup = h.cache_worker.ios_submitted();
        h.admission.set_load_admit(0.0);

        for i in 0..50u64 {
            read_blocking(&h.engine, i * 4096).unwrap();
        }

        // Measured phase: 50 hits spilled to core, zero cache reads.
        assert_eq!(h.core_worker.ios_submitted() - core_after_warmup, 50);
        assert_eq!(h.cache_worker.ios_submitted(), cache_after_warmup);
    }

    #[test]
    fn s2_load_admit_one_serves_every_hit_from_cache() {
        let h = build_harness(CacheMode::Mfwa);
        h.admission.set_data_admit(true);
        h.admission.set_load_admit(1.0);

        for i in 0..50u64 {
            read_blocking(&h.engine, i * 4096).unwrap();
        }
        // Warm-up misses go to core with promotion; backfill runs
        // asynchronously, so give it time to land before re-reading.
        std::thread::sleep(Duration::from_millis(200));
        let core_after_warmup = h.core_worker.ios_submitted();
        let cache_after_warmup = h.cache_worker.ios_submitted();
        for i in 0..50u64 {
            read_blocking(&h.engine, i * 4096).unwrap();
        }

        // Measured phase: 50 hits served from cache, zero new core reads.
        assert_eq!(h.core_worker.ios_submitted(), core_after_warmup);
        assert_eq!(h.cache_worker.ios_submitted() - cache_after_warmup, 50);
    }

    #[test]
    fn s3_data_admit_false_promotes_nothing() {
        let h = build_harness(CacheMode::Mfwa);
        h.admission.set_data_admit(false);
        h.admission.set_load_admit(1.0);

        for i in 0..100u64 {
            read_blocking(&h.engine, i * 4096).unwrap();
        }

        assert_eq!(h.core_worker.ios_submitted(), 100);
        assert_eq!(h.stats.promotions.load(std::sync::atomic::Ordering::Relaxed), 0);
        // No backfill write landed on the cache device either.
        assert_eq!(h.cache_worker.ios_submitted(), 0);
    }

    #[test]
    fn promoting_miss_eventually_becomes_a_hit() {
        let h = build_harness(CacheMode::Mfwa);
        h.admission.set_data_admit(true);
        h.admission.set_load_admit(1.0);

        read_blocking(&h.engine, 0).unwrap();
        // Give the backfill write (scheduled after completion) time to land.
        std::thread::sleep(Duration::from_millis(100));
        read_blocking(&h.engine, 0).unwrap();

        assert_eq!(h.stats.cache_hits.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(h.stats.cache_misses.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn pt_mode_never_touches_the_cache_device() {
        let h = build_harness(CacheMode::Pt);
        for i in 0..20u64 {
            read_blocking(&h.engine, i * 4096).unwrap();
        }
        assert_eq!(h.cache_worker.ios_submitted(), 0);
        assert_eq!(h.core_worker.ios_submitted(), 20);
    }

    #[test]
    fn pending_misses_blocked_forces_pass_through() {
        let h = build_harness(CacheMode::Mfwa);
        h.admission.set_data_admit(true);
        h.admission.set_load_admit(1.0);
        h.engine.pending_misses_blocked_handle().store(true, Ordering::SeqCst);

        read_blocking(&h.engine, 0).unwrap();

        assert_eq!(h.cache_worker.ios_submitted(), 0);
        assert_eq!(h.core_worker.ios_submitted(), 1);
    }

    #[test]
    fn completion_fires_exactly_once_per_request() {
        let h = build_harness(CacheMode::Mfwa);
        h.admission.set_data_admit(true);
        h.admission.set_load_admit(1.0);
        for i in 0..30u64 {
            read_blocking(&h.engine, i * 4096).unwrap();
        }
        // `read_blocking` itself asserts single-fire via its channel
        // recv; reaching here without panicking is the assertion.
    }

    #[test]
    fn write_through_completes_after_both_legs() {
        let h = build_harness(CacheMode::Mfwt);
        let (tx, rx) = mpsc::channel();
        h.engine.write(
            0,
            4096,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(h.cache_worker.ios_submitted(), 1);
        assert_eq!(h.core_worker.ios_submitted(), 1);
    }
}
