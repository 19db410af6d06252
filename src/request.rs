//! The ephemeral per-I/O request object.
//!
//! Grounded in `struct ocf_request`'s fan-out/completion idiom from
//! `engine_mfwa.c`: many sub-I/Os may complete `R` concurrently, and the
//! "last decrementer" — whichever completion drives `req_remaining` to
//! zero — is the one that runs the terminal transition. `Request` is
//! always handled behind an `Arc`; cloning the `Arc` is how a sub-I/O
//! extends `R`'s lifetime past the caller-visible completion (backfill).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::config::Direction;
use crate::error::EngineError;
use crate::mapping::LineLockGuard;

pub type Completion = Box<dyn FnOnce(Result<(), EngineError>) + Send>;

/// Per-request mapping info captured by `prepare_clines`.
pub struct MappingInfo {
    pub line_id: u64,
    pub hit: bool,
    pub dirty_any: bool,
    pub re_part: bool,
    pub rd_locked: bool,
}

pub struct Request {
    pub direction: Direction,
    pub addr: u64,
    pub byte_length: u32,

    /// Captured once at entry, never re-read for the lifetime of `R`.
    pub data_admit_allowed: bool,
    pub load_admit_allowed: bool,

    pub mapping: Mutex<MappingInfo>,
    lock: Mutex<LineLockGuard>,

    /// Number of outstanding sub-I/Os; the decrement-to-zero transition
    /// is the only safe place to run terminal logic.
    req_remaining: AtomicUsize,

    error: Mutex<Option<EngineError>>,
    completion: Mutex<Option<Completion>>,

    /// Owned by `R` only while promoting; freed on promotion completion
    /// or on error.
    pub promotion_buf: Mutex<Option<Vec<u8>>>,

    pub core_error: std::sync::atomic::AtomicBool,

    /// Set once the mapping layer has actually prepared a line for this
    /// request. Gates metadata cleanup (invalidate) on a later core
    /// error: a pure pass-through request never touched the mapping
    /// layer and has nothing to roll back.
    pub cache_managed: std::sync::atomic::AtomicBool,
}

impl Request {
    pub fn new(
        direction: Direction,
        addr: u64,
        byte_length: u32,
        completion: Completion,
    ) -> Self {
        Self::with_decisions(direction, addr, byte_length, false, false, completion)
    }

    pub fn with_decisions(
        direction: Direction,
        addr: u64,
        byte_length: u32,
        data_admit_allowed: bool,
        load_admit_allowed: bool,
        completion: Completion,
    ) -> Self {
        Request {
            direction,
            addr,
            byte_length,
            data_admit_allowed,
            load_admit_allowed,
            mapping: Mutex::new(MappingInfo {
                line_id: 0,
                hit: false,
                dirty_any: false,
                re_part: false,
                rd_locked: false,
            }),
            lock: Mutex::new(LineLockGuard::None),
            req_remaining: AtomicUsize::new(0),
            error: Mutex::new(None),
            completion: Mutex::new(Some(completion)),
            promotion_buf: Mutex::new(None),
            core_error: std::sync::atomic::AtomicBool::new(false),
            cache_managed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_lock(&self, lock: LineLockGuard) {
        *self.lock.lock().unwrap() = lock;
    }

    /// Releases any held line lock. Idempotent.
    pub fn unlock(&self) {
        *self.lock.lock().unwrap() = LineLockGuard::None;
    }

    pub fn set_remaining(&self, n: usize) {
        self.req_remaining.store(n, Ordering::SeqCst);
    }

    /// Decrements the outstanding sub-I/O counter; returns `true` for
    /// exactly one caller per request — the last decrementer.
    pub fn decrement_is_last(&self) -> bool {
        self.req_remaining.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// OR-accumulates an error into the request's error field. Multiple
    /// sub-I/Os may race to set this; only the first recorded error is
    /// kept, matching the "accumulate, inspect once" policy.
    pub fn record_error(&self, err: EngineError) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.lock().unwrap().is_some()
    }

    pub fn take_error(&self) -> Option<EngineError> {
        self.error.lock().unwrap().take()
    }

    /// Fires the caller's completion exactly once. Panics if called
    /// twice — that would indicate a broken fan-out invariant.
    pub fn complete(&self, result: Result<(), EngineError>) {
        let cb = self
            .completion
            .lock()
            .unwrap()
            .take()
            .expect("request completed more than once");
        cb(result);
    }

    pub fn is_completed(&self) -> bool {
        self.completion.lock().unwrap().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::Arc;

    #[test]
    fn completion_fires_exactly_once() {
        let fired = Arc::new(StdAtomicUsize::new(0));
        let fired2 = fired.clone();
        let req = Request::new(
            Direction::Read,
            0,
            4096,
            Box::new(move |_| {
                fired2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        req.complete(Ok(()));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic]
    fn double_completion_panics() {
        let req = Request::new(Direction::Read, 0, 4096, Box::new(|_| {}));
        req.complete(Ok(()));
        req.complete(Ok(()));
    }

    #[test]
    fn last_decrementer_is_identified() {
        let req = Request::new(Direction::Read, 0, 4096, Box::new(|_| {}));
        req.set_remaining(3);
        assert!(!req.decrement_is_last());
        assert!(!req.decrement_is_last());
        assert!(req.decrement_is_last());
    }
}
