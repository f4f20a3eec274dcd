//! Observable counters exposed by `stats()` (§6).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct Stats {
    total_faults: AtomicU64,
    read_faults: AtomicU64,
    write_faults: AtomicU64,
    pages_fetched: AtomicU64,
    pages_sent: AtomicU64,
    invalidations_sent: AtomicU64,
    invalidations_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    fault_latency_total_us: AtomicU64,
    fault_latency_min_us: AtomicU64,
    fault_latency_max_us: AtomicU64,
}

/// Point-in-time snapshot returned by `stats()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub total_faults: u64,
    pub read_faults: u64,
    pub write_faults: u64,
    pub pages_fetched: u64,
    pub pages_sent: u64,
    pub invalidations_sent: u64,
    pub invalidations_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub fault_latency_avg_us: u64,
    pub fault_latency_min_us: u64,
    pub fault_latency_max_us: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_fault(&self, kind_is_write: bool) {
        self.total_faults.fetch_add(1, Ordering::Relaxed);
        if kind_is_write {
            self.write_faults.fetch_add(1, Ordering::Relaxed);
        } else {
            self.read_faults.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_fault_latency(&self, elapsed: Duration) {
        let us = elapsed.as_micros().min(u128::from(u64::MAX)) as u64;
        self.fault_latency_total_us.fetch_add(us, Ordering::Relaxed);
        self.fault_latency_min_us
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                Some(if cur == 0 { us } else { cur.min(us) })
            })
            .ok();
        self.fault_latency_max_us
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| Some(cur.max(us)))
            .ok();
    }

    pub fn record_page_fetched(&self) {
        self.pages_fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_page_sent(&self, bytes: usize) {
        self.pages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_bytes_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_invalidation_sent(&self) {
        self.invalidations_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation_received(&self) {
        self.invalidations_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let total = self.total_faults.load(Ordering::Relaxed);
        let sum = self.fault_latency_total_us.load(Ordering::Relaxed);
        let avg = if total == 0 { 0 } else { sum / total };
        StatsSnapshot {
            total_faults: total,
            read_faults: self.read_faults.load(Ordering::Relaxed),
            write_faults: self.write_faults.load(Ordering::Relaxed),
            pages_fetched: self.pages_fetched.load(Ordering::Relaxed),
            pages_sent: self.pages_sent.load(Ordering::Relaxed),
            invalidations_sent: self.invalidations_sent.load(Ordering::Relaxed),
            invalidations_received: self.invalidations_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            fault_latency_avg_us: avg,
            fault_latency_min_us: self.fault_latency_min_us.load(Ordering::Relaxed),
            fault_latency_max_us: self.fault_latency_max_us.load(Ordering::Relaxed),
        }
    }
}
