//! Wire protocol to a simulated SSD, grounded in `simfs-ctx.c` /
//! `cache-vol.c`'s `req_header` struct and `_submit_read_io`/
//! `_submit_write_io` routines.
//!
//! Per request, over a Unix-domain stream socket:
//! 1. send exactly 24 bytes, little-endian packed:
//!    `direction:u32, addr:u64, size:u32, start_time_us:u64`;
//! 2. if data transfer is enabled, transfer `size` bytes (written for a
//!    write, read for a read);
//! 3. receive exactly 8 bytes: `time_used_us:u64`, then sleep that long
//!    to simulate device latency.

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::Direction;

pub const REQ_HEADER_LENGTH: usize = 24;

pub struct ReqHeader {
    pub direction: Direction,
    pub addr: u64,
    pub size: u32,
    pub start_time_us: u64,
}

impl ReqHeader {
    pub fn encode(&self) -> [u8; REQ_HEADER_LENGTH] {
        let mut buf = [0u8; REQ_HEADER_LENGTH];
        buf[0..4].copy_from_slice(&self.direction.as_wire_u32().to_le_bytes());
        buf[4..12].copy_from_slice(&self.addr.to_le_bytes());
        buf[12..16].copy_from_slice(&self.size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.start_time_us.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; REQ_HEADER_LENGTH]) -> Self {
        let direction = match u32::from_le_bytes(buf[0..4].try_into().unwrap()) {
            1 => Direction::Write,
            _ => Direction::Read,
        };
        let addr = u64::from_le_bytes(buf[4..12].try_into().unwrap());
        let size = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let start_time_us = u64::from_le_bytes(buf[16..24].try_into().unwrap());
        ReqHeader {
            direction,
            addr,
            size,
            start_time_us,
        }
    }
}

/// A client connection to one simulated device's Unix-domain socket.
/// One connection per device; the device submission worker is the sole
/// caller, but the stream is still behind a mutex since the client may
/// outlive any particular worker generation across reconnects.
pub struct SimVolumeClient {
    stream: Mutex<UnixStream>,
    transfer_data: bool,
}

impl SimVolumeClient {
    pub fn connect(path: &str, transfer_data: bool) -> io::Result<Self> {
        let stream = UnixStream::connect(path)?;
        Ok(SimVolumeClient {
            stream: Mutex::new(stream),
            transfer_data,
        })
    }

    /// Submits one I/O and returns the simulated latency. Does not sleep
    /// itself — the device worker sleeps, since that's the thread whose
    /// blocking models the device's busy time.
    pub fn submit(
        &self,
        direction: Direction,
        addr: u64,
        size: u32,
        start_time_us: u64,
    ) -> io::Result<Duration> {
        let header = ReqHeader {
            direction,
            addr,
            size,
            start_time_us,
        };

        let mut stream = self.stream.lock();
        stream.write_all(&header.encode())?;

        if self.transfer_data && size > 0 {
            match direction {
                Direction::Write => {
                    let payload = vec![0u8; size as usize];
                    stream.write_all(&payload)?;
                }
                Direction::Read => {
                    let mut payload = vec![0u8; size as usize];
                    stream.read_exact(&mut payload)?;
                }
            }
        }

        let mut latency_buf = [0u8; 8];
        stream.read_exact(&mut latency_buf)?;
        let time_used_us = u64::from_le_bytes(latency_buf);

        Ok(Duration::from_micros(time_used_us))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = ReqHeader {
            direction: Direction::Write,
            addr: 0xdead_beef,
            size: 4096,
            start_time_us: 123_456_789,
        };
        let encoded = header.encode();
        assert_eq!(encoded.len(), REQ_HEADER_LENGTH);

        let decoded = ReqHeader::decode(&encoded);
        assert_eq!(decoded.direction, Direction::Write);
        assert_eq!(decoded.addr, 0xdead_beef);
        assert_eq!(decoded.size, 4096);
        assert_eq!(decoded.start_time_us, 123_456_789);
    }
}
