//! Per-direction traffic counters.

use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;

/// Counters for one tunnel direction.
///
/// `msgs`/`bytes` count framed RPC messages, `raw_*` count the segment
/// bytes actually crossing the DNS wire (including retransmissions).
#[derive(Debug, Default)]
pub struct Metrics {
    name: &'static str,
    msgs_recv: AtomicU64,
    msgs_sent: AtomicU64,
    bytes_recv: AtomicU64,
    bytes_sent: AtomicU64,
    raw_bytes_in: AtomicU64,
    raw_bytes_out: AtomicU64,
}

impl Metrics {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            msgs_recv: AtomicU64::new(0),
            msgs_sent: AtomicU64::new(0),
            bytes_recv: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            raw_bytes_in: AtomicU64::new(0),
            raw_bytes_out: AtomicU64::new(0),
        }
    }

    pub fn recv(&self, n: usize) {
        self.msgs_recv.fetch_add(1, Ordering::Relaxed);
        self.bytes_recv.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn sent(&self, n: usize) {
        self.msgs_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn raw_in(&self, n: usize) {
        self.raw_bytes_in.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn raw_out(&self, n: usize) {
        self.raw_bytes_out.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn log_summary(&self) {
        debug!(
            "{} recv/sent msgs={}/{} bytes={}/{} raw in/out={}/{}",
            self.name,
            self.msgs_recv.load(Ordering::Relaxed),
            self.msgs_sent.load(Ordering::Relaxed),
            self.bytes_recv.load(Ordering::Relaxed),
            self.bytes_sent.load(Ordering::Relaxed),
            self.raw_bytes_in.load(Ordering::Relaxed),
            self.raw_bytes_out.load(Ordering::Relaxed),
        );
    }
}
