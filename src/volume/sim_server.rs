//! A minimal in-process simulated SSD, for tests only.
//!
//! Speaks exactly the client's half of the wire protocol in `wire.rs`
//! so the full worker → volume → throughput-log pipeline is testable
//! without real hardware, mirroring `simfs-ctx.c`'s role in the
//! original benchmark harness.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::wire::{ReqHeader, REQ_HEADER_LENGTH};

/// Computes a reply latency in microseconds for a given request. Tests
/// use this to simulate a device with a target throughput: for a fixed
/// block size, `latency_us = size_bytes * 1_000_000 / target_bytes_per_sec`.
pub type LatencyFn = Arc<dyn Fn(&ReqHeader) -> u64 + Send + Sync>;

pub fn fixed_latency(latency_us: u64) -> LatencyFn {
    Arc::new(move |_| latency_us)
}

pub fn throughput_latency(target_bytes_per_sec: f64) -> LatencyFn {
    Arc::new(move |h: &ReqHeader| {
        if target_bytes_per_sec <= 0.0 {
            return 0;
        }
        ((h.size as f64) * 1_000_000.0 / target_bytes_per_sec) as u64
    })
}

pub struct SimServer {
    path: PathBuf,
    should_stop: Arc<AtomicBool>,
    accept_handle: Option<JoinHandle<()>>,
}

impl SimServer {
    pub fn start(path: impl AsRef<Path>, transfer_data: bool, latency_fn: LatencyFn) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;

        let should_stop = Arc::new(AtomicBool::new(false));
        let stop_flag = should_stop.clone();

        let handle = std::thread::Builder::new()
            .name("sim-server-accept".into())
            .spawn(move || {
                for stream in listener.incoming() {
                    if stop_flag.load(Ordering::SeqCst) {
                        break;
                    }
                    match stream {
                        Ok(conn) => {
                            conn.set_nonblocking(false).ok();
                            let stop = stop_flag.clone();
                            let latency_fn = latency_fn.clone();
                            let transfer_data = transfer_data;
                            std::thread::spawn(move || {
                                serve_connection(conn, transfer_data, latency_fn, stop);
                            });
                        }
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            std::thread::sleep(std::time::Duration::from_millis(5));
                        }
                        Err(_) => break,
                    }
                }
            })?;

        Ok(SimServer {
            path,
            should_stop,
            accept_handle: Some(handle),
        })
    }
}

impl Drop for SimServer {
    fn drop(&mut self) {
        self.should_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_handle.take() {
            // Connecting to our own socket unblocks the accept loop's
            // `incoming()` iterator promptly.
            let _ = UnixStream::connect(&self.path);
            let _ = handle.join();
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

fn serve_connection(
    mut conn: UnixStream,
    transfer_data: bool,
    latency_fn: LatencyFn,
    should_stop: Arc<AtomicBool>,
) {
    loop {
        if should_stop.load(Ordering::SeqCst) {
            return;
        }

        let mut header_buf = [0u8; REQ_HEADER_LENGTH];
        if conn.read_exact(&mut header_buf).is_err() {
            return;
        }
        let header = ReqHeader::decode(&header_buf);

        if transfer_data && header.size > 0 {
            match header.direction {
                crate::config::Direction::Write => {
                    let mut buf = vec![0u8; header.size as usize];
                    if conn.read_exact(&mut buf).is_err() {
                        return;
                    }
                }
                crate::config::Direction::Read => {
                    let buf = vec![0u8; header.size as usize];
                    if conn.write_all(&buf).is_err() {
                        return;
                    }
                }
            }
        }

        let latency_us = latency_fn(&header);
        if conn.write_all(&latency_us.to_le_bytes()).is_err() {
            return;
        }
    }
}
