//! Bounded circular per-device throughput log.
//!
//! Grounded in `cache-obj.c`/`core-obj.c`'s `cache_log_entry` ring: a
//! fixed-capacity buffer of `(finish_time_ms, bytes)` pairs, overwritten
//! oldest-first once full, queried by scanning backward from the newest
//! entry until a timestamp falls at or before the window's start.

use parking_lot::RwLock;

#[derive(Debug, Clone, Copy)]
struct Entry {
    finish_time_ms: f64,
    bytes: u32,
}

struct Inner {
    entries: Vec<Option<Entry>>,
    /// Index where the next `push` will write.
    head: usize,
    len: usize,
}

/// A fixed-capacity ring of completed-I/O samples for one device.
pub struct ThroughputLog {
    capacity: usize,
    inner: RwLock<Inner>,
}

impl ThroughputLog {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "throughput log capacity must be positive");
        ThroughputLog {
            capacity,
            inner: RwLock::new(Inner {
                entries: vec![None; capacity],
                head: 0,
                len: 0,
            }),
        }
    }

    /// Appends a completed I/O. When full, overwrites the oldest entry.
    pub fn push(&self, finish_time_ms: f64, bytes: u32) {
        let mut inner = self.inner.write();
        let head = inner.head;
        inner.entries[head] = Some(Entry {
            finish_time_ms,
            bytes,
        });
        inner.head = (head + 1) % self.capacity;
        if inner.len < self.capacity {
            inner.len += 1;
        }
    }

    /// Sums bytes of entries with `finish_time_ms ∈ (begin_ms, end_ms]`,
    /// scanning newest-first and stopping as soon as a timestamp falls
    /// at or before `begin_ms`. Returns throughput in kB/s; `0.0` for an
    /// empty log. Callers must ensure `end_ms > begin_ms`.
    pub fn query_throughput(&self, begin_ms: f64, end_ms: f64) -> f64 {
        let inner = self.inner.read();
        if inner.len == 0 {
            return 0.0;
        }

        let mut sum_bytes: u64 = 0;
        // Newest entry is the slot just behind `head`.
        let mut idx = (inner.head + self.capacity - 1) % self.capacity;
        for _ in 0..inner.len {
            let entry = match inner.entries[idx] {
                Some(e) => e,
                None => break,
            };
            if entry.finish_time_ms <= begin_ms {
                break;
            }
            if entry.finish_time_ms <= end_ms {
                sum_bytes += entry.bytes as u64;
            }
            idx = (idx + self.capacity - 1) % self.capacity;
        }

        let sum_kb = sum_bytes as f64 / 1024.0;
        sum_kb * 1000.0 / (end_ms - begin_ms)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_log_returns_zero() {
        let log = ThroughputLog::new(16);
        assert_eq!(log.query_throughput(0.0, 100.0), 0.0);
    }

    #[test]
    fn query_matches_worked_example() {
        // S4: entries (t=100,4096), (t=200,4096), (t=300,8192); query(50,350)
        // == (4+4+8) * 1000 / 300 kB/s.
        let log = ThroughputLog::new(16);
        log.push(100.0, 4096);
        log.push(200.0, 4096);
        log.push(300.0, 8192);

        let result = log.query_throughput(50.0, 350.0);
        let expected = 16.0 * 1000.0 / 300.0;
        assert!((result - expected).abs() < 1e-9, "{result} vs {expected}");
    }

    #[test]
    fn window_excludes_entries_at_or_before_begin() {
        let log = ThroughputLog::new(16);
        log.push(100.0, 4096);
        log.push(200.0, 4096);

        // begin == first entry's timestamp excludes it.
        let result = log.query_throughput(100.0, 250.0);
        let expected = 4.0 * 1000.0 / 150.0;
        assert!((result - expected).abs() < 1e-9);
    }

    #[test]
    fn overflow_drops_oldest_entries() {
        let log = ThroughputLog::new(4);
        for i in 0..10 {
            log.push(i as f64 * 10.0, 1024);
        }
        assert_eq!(log.len(), 4);

        // Only the last 4 pushes (t=60,70,80,90) should remain.
        let result = log.query_throughput(55.0, 95.0);
        let expected = 4.0 * 1000.0 / 40.0;
        assert!((result - expected).abs() < 1e-9);
    }

    #[test]
    fn capacity_is_respected() {
        let log = ThroughputLog::new(120_000);
        assert_eq!(log.capacity(), 120_000);
    }
}
