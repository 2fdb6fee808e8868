//! Per-service statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters maintained by one disk I/O service.
#[derive(Debug)]
pub struct ServiceStats {
    num_accesses: AtomicU64,
    num_low_prio_accesses: AtomicU64,
    num_requested_flushes: AtomicU64,
    num_ignored_flushes_evicted: AtomicU64,
    num_ignored_flushes_cleaned: AtomicU64,
    num_ignored_flushes_old: AtomicU64,
    tot_flush_delay_us: AtomicU64,
    max_flush_delay_us: AtomicU64,
    min_flush_delay_us: AtomicU64,
}

impl Default for ServiceStats {
    fn default() -> Self {
        Self {
            num_accesses: AtomicU64::new(0),
            num_low_prio_accesses: AtomicU64::new(0),
            num_requested_flushes: AtomicU64::new(0),
            num_ignored_flushes_evicted: AtomicU64::new(0),
            num_ignored_flushes_cleaned: AtomicU64::new(0),
            num_ignored_flushes_old: AtomicU64::new(0),
            tot_flush_delay_us: AtomicU64::new(0),
            max_flush_delay_us: AtomicU64::new(0),
            min_flush_delay_us: AtomicU64::new(u64::MAX),
        }
    }
}

impl ServiceStats {
    pub fn add_accesses(&self, n: usize) {
        self.num_accesses.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn inc_low_prio_access(&self) {
        self.num_low_prio_accesses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_requested_flushes(&self, n: usize) {
        self.num_requested_flushes
            .fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn inc_ignored_evicted(&self) {
        self.num_ignored_flushes_evicted
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ignored_cleaned(&self) {
        self.num_ignored_flushes_cleaned
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ignored_old(&self) {
        self.num_ignored_flushes_old.fetch_add(1, Ordering::Relaxed);
    }

    /// Record queue-to-dispatch latency of one committed write-back.
    pub fn record_flush_delay(&self, delay: Duration) {
        let us = delay.as_micros() as u64;
        self.tot_flush_delay_us.fetch_add(us, Ordering::Relaxed);
        self.max_flush_delay_us.fetch_max(us, Ordering::Relaxed);
        self.min_flush_delay_us.fetch_min(us, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            num_accesses: self.num_accesses.load(Ordering::Relaxed),
            num_low_prio_accesses: self.num_low_prio_accesses.load(Ordering::Relaxed),
            num_requested_flushes: self.num_requested_flushes.load(Ordering::Relaxed),
            num_ignored_flushes_evicted: self
                .num_ignored_flushes_evicted
                .load(Ordering::Relaxed),
            num_ignored_flushes_cleaned: self
                .num_ignored_flushes_cleaned
                .load(Ordering::Relaxed),
            num_ignored_flushes_old: self.num_ignored_flushes_old.load(Ordering::Relaxed),
            tot_flush_delay_us: self.tot_flush_delay_us.load(Ordering::Relaxed),
            max_flush_delay_us: self.max_flush_delay_us.load(Ordering::Relaxed),
            min_flush_delay_us: self.min_flush_delay_us.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a service's counters.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    /// Requests handed to the async engine, either priority class.
    pub num_accesses: u64,
    /// Low-priority requests examined by the commit protocol.
    pub num_low_prio_accesses: u64,
    /// Write-backs solicited from the cache while idle.
    pub num_requested_flushes: u64,
    pub num_ignored_flushes_evicted: u64,
    pub num_ignored_flushes_cleaned: u64,
    pub num_ignored_flushes_old: u64,
    pub tot_flush_delay_us: u64,
    pub max_flush_delay_us: u64,
    /// `u64::MAX` until the first write-back is dispatched.
    pub min_flush_delay_us: u64,
}

impl StatsSnapshot {
    pub fn num_ignored_flushes(&self) -> u64 {
        self.num_ignored_flushes_evicted
            + self.num_ignored_flushes_cleaned
            + self.num_ignored_flushes_old
    }
}
