//! Per-device submission worker.
//!
//! Grounded in `cache-vol.c`'s `req_entry` FIFO + mutex + semaphore and
//! `_submit_thread_func`: a single dedicated consumer thread drains
//! enqueued I/Os so that simulated device latency (a blocking sleep)
//! never runs on a submitter thread. `crossbeam::channel` replaces the
//! original's linked-list-plus-POSIX-semaphore pair — an unbounded
//! channel's blocking `recv` already gives "wait for work, wake exactly
//! once per item" with no busy polling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam::channel::{unbounded, Receiver, Sender, TryRecvError};
use tracing::{debug, warn};

use crate::config::Direction;
use crate::error::EngineError;
use crate::throughput_log::ThroughputLog;
use crate::volume::SimVolumeClient;

pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_micros() as u64
}

pub fn now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs_f64()
        * 1000.0
}

pub type IoCompletion = Box<dyn FnOnce(Result<(), EngineError>) + Send>;

pub enum WorkItem {
    Io {
        direction: Direction,
        addr: u64,
        size: u32,
        on_done: IoCompletion,
    },
    Stop,
}

/// Handle to a running device worker: the sending half of its FIFO plus
/// bookkeeping to drain-and-stop it.
pub struct DeviceWorker {
    name: String,
    sender: Sender<WorkItem>,
    /// Kept alongside the worker thread's own clone so `force_stop` can
    /// race it to drain queued-but-not-yet-started work.
    receiver: Receiver<WorkItem>,
    handle: Option<JoinHandle<()>>,
    ios_submitted: Arc<AtomicU64>,
}

impl DeviceWorker {
    pub fn spawn(name: impl Into<String>, client: Arc<SimVolumeClient>, log: Arc<ThroughputLog>) -> Self {
        let name = name.into();
        let (sender, receiver): (Sender<WorkItem>, Receiver<WorkItem>) = unbounded();
        let ios_submitted = Arc::new(AtomicU64::new(0));
        let counter = ios_submitted.clone();
        let thread_name = name.clone();
        let worker_receiver = receiver.clone();

        let handle = std::thread::Builder::new()
            .name(format!("device-worker-{thread_name}"))
            .spawn(move || {
                for item in worker_receiver.iter() {
                    match item {
                        WorkItem::Stop => {
                            debug!(device = %thread_name, "submission worker stopping");
                            break;
                        }
                        WorkItem::Io {
                            direction,
                            addr,
                            size,
                            on_done,
                        } => {
                            let start_time_us = now_us();
                            match client.submit(direction, addr, size, start_time_us) {
                                Ok(latency) => {
                                    std::thread::sleep(latency);
                                    log.push(now_ms(), size);
                                    counter.fetch_add(1, Ordering::Relaxed);
                                    on_done(Ok(()));
                                }
                                Err(e) => {
                                    warn!(device = %thread_name, error = %e, "device submission failed");
                                    on_done(Err(EngineError::CoreIo(e.to_string())));
                                }
                            }
                        }
                    }
                }
            })
            .expect("failed to spawn device worker thread");

        DeviceWorker {
            name,
            sender,
            receiver,
            handle: Some(handle),
            ios_submitted,
        }
    }

    pub fn submit(&self, direction: Direction, addr: u64, size: u32, on_done: IoCompletion) {
        let _ = self.sender.send(WorkItem::Io {
            direction,
            addr,
            size,
            on_done,
        });
    }

    pub fn ios_submitted(&self) -> u64 {
        self.ios_submitted.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Drains any queued-but-not-yet-started work (discarding it
    /// silently, racing the worker thread for each item) then stops the
    /// worker thread. This is the shutdown path: pending requests are
    /// dropped because shutdown happens after the benchmark has
    /// logically completed.
    pub fn force_stop(mut self) {
        loop {
            match self.receiver.try_recv() {
                Ok(_) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        let _ = self.sender.send(WorkItem::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DeviceWorker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.sender.send(WorkItem::Stop);
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{fixed_latency, SimServer};
    use std::sync::mpsc;

    #[test]
    fn worker_processes_queued_ios_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("worker.sock");
        let _server = SimServer::start(&socket_path, false, fixed_latency(0)).unwrap();
        let client = Arc::new(SimVolumeClient::connect(socket_path.to_str().unwrap(), false).unwrap());
        let log = Arc::new(ThroughputLog::new(1024));
        let worker = DeviceWorker::spawn("test", client, log.clone());

        let (tx, rx) = mpsc::channel();
        for i in 0..5u64 {
            let tx = tx.clone();
            worker.submit(
                Direction::Read,
                i * 4096,
                4096,
                Box::new(move |res| {
                    tx.send((i, res.is_ok())).unwrap();
                }),
            );
        }

        for _ in 0..5 {
            let (_, ok) = rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
            assert!(ok);
        }
        assert_eq!(worker.ios_submitted(), 5);
        assert_eq!(log.len(), 5);
    }
}
