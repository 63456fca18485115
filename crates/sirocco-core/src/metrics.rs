//! Per-worker traffic counters.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Counters owned by one worker thread. Cache-line aligned so neighboring
/// workers never share a line.
#[repr(align(64))]
pub struct WorkerMetrics {
    requests: AtomicU64,
    active_connections: AtomicUsize,
    bytes_tx: AtomicU64,
}

/// Point-in-time copy of a worker's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub active_connections: usize,
    pub bytes_tx: u64,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            active_connections: AtomicUsize::new(0),
            bytes_tx: AtomicU64::new(0),
        }
    }

    /// One request dispatched through the pipeline (HTTP/1.1 request or
    /// HTTP/2 stream).
    pub fn inc_req(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn conn_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn conn_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Bytes accepted by the socket: response heads, bodies and chunk
    /// framing.
    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_tx.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            bytes_tx: self.bytes_tx.load(Ordering::Relaxed),
        }
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = WorkerMetrics::new();
        m.conn_opened();
        m.inc_req();
        m.add_bytes(128);
        let snap = m.snapshot();
        assert_eq!(snap.active_connections, 1);
        assert_eq!(snap.requests, 1);
        assert_eq!(snap.bytes_tx, 128);

        m.conn_closed();
        assert_eq!(m.snapshot().active_connections, 0);
    }

    #[test]
    fn workers_do_not_share_cache_lines() {
        assert_eq!(std::mem::align_of::<WorkerMetrics>(), 64);
    }
}
