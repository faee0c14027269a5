//! Runtime counters for the DSM engine
//!
//! Atomic counter sink incremented by the coherence core and rendered by the
//! embedding application. Counters are cache-padded to keep hot-path
//! increments from false-sharing, and fetch latency is tracked as an
//! exponential moving average.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;
use serde::{Deserialize, Serialize};

/// Atomic runtime statistics for one node.
#[derive(Debug, Default)]
pub struct DsmCounters {
    /// Total page faults taken by the trap layer.
    pub page_faults: CachePadded<AtomicU64>,
    /// Read faults.
    pub read_faults: CachePadded<AtomicU64>,
    /// Write faults.
    pub write_faults: CachePadded<AtomicU64>,
    /// Pages fetched from remote owners.
    pub pages_fetched: CachePadded<AtomicU64>,
    /// Pages served to remote requesters.
    pub pages_served: CachePadded<AtomicU64>,
    /// Invalidations sent.
    pub invalidations_sent: CachePadded<AtomicU64>,
    /// Invalidations received and applied.
    pub invalidations_received: CachePadded<AtomicU64>,
    /// Bytes written to the wire.
    pub bytes_sent: CachePadded<AtomicU64>,
    /// Bytes read from the wire.
    pub bytes_received: CachePadded<AtomicU64>,
    /// Outbound send retries.
    pub network_retries: CachePadded<AtomicU64>,
    /// Sends abandoned after retry exhaustion.
    pub network_failures: CachePadded<AtomicU64>,
    /// Bounded waits that expired.
    pub timeouts: CachePadded<AtomicU64>,
    /// Distributed lock acquisitions.
    pub lock_acquires: CachePadded<AtomicU64>,
    /// Barrier waits completed.
    pub barrier_waits: CachePadded<AtomicU64>,
    /// Moving average of page-fetch latency in nanoseconds.
    avg_fetch_latency_ns: CachePadded<AtomicU64>,
}

impl DsmCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed remote fetch with its latency.
    pub fn record_fetch(&self, latency_ns: u64) {
        self.pages_fetched.fetch_add(1, Ordering::Relaxed);
        // Exponential moving average, 7/8 weight to history.
        let current = self.avg_fetch_latency_ns.load(Ordering::Relaxed);
        let new_avg = if current == 0 {
            latency_ns
        } else {
            (current * 7 + latency_ns) / 8
        };
        self.avg_fetch_latency_ns.store(new_avg, Ordering::Relaxed);
    }

    /// Record a fault of the given kind.
    pub fn record_fault(&self, write: bool) {
        self.page_faults.fetch_add(1, Ordering::Relaxed);
        if write {
            self.write_faults.fetch_add(1, Ordering::Relaxed);
        } else {
            self.read_faults.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Cheap point-in-time copy of all counters.
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            page_faults: self.page_faults.load(Ordering::Relaxed),
            read_faults: self.read_faults.load(Ordering::Relaxed),
            write_faults: self.write_faults.load(Ordering::Relaxed),
            pages_fetched: self.pages_fetched.load(Ordering::Relaxed),
            pages_served: self.pages_served.load(Ordering::Relaxed),
            invalidations_sent: self.invalidations_sent.load(Ordering::Relaxed),
            invalidations_received: self.invalidations_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            network_retries: self.network_retries.load(Ordering::Relaxed),
            network_failures: self.network_failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            lock_acquires: self.lock_acquires.load(Ordering::Relaxed),
            barrier_waits: self.barrier_waits.load(Ordering::Relaxed),
            avg_fetch_latency_ns: self.avg_fetch_latency_ns.load(Ordering::Relaxed),
        }
    }

    /// Reset every counter to zero.
    pub fn reset(&self) {
        self.page_faults.store(0, Ordering::Relaxed);
        self.read_faults.store(0, Ordering::Relaxed);
        self.write_faults.store(0, Ordering::Relaxed);
        self.pages_fetched.store(0, Ordering::Relaxed);
        self.pages_served.store(0, Ordering::Relaxed);
        self.invalidations_sent.store(0, Ordering::Relaxed);
        self.invalidations_received.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.network_retries.store(0, Ordering::Relaxed);
        self.network_failures.store(0, Ordering::Relaxed);
        self.timeouts.store(0, Ordering::Relaxed);
        self.lock_acquires.store(0, Ordering::Relaxed);
        self.barrier_waits.store(0, Ordering::Relaxed);
        self.avg_fetch_latency_ns.store(0, Ordering::Relaxed);
    }
}

/// Serializable snapshot of [`DsmCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountersSnapshot {
    pub page_faults: u64,
    pub read_faults: u64,
    pub write_faults: u64,
    pub pages_fetched: u64,
    pub pages_served: u64,
    pub invalidations_sent: u64,
    pub invalidations_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub network_retries: u64,
    pub network_failures: u64,
    pub timeouts: u64,
    pub lock_acquires: u64,
    pub barrier_waits: u64,
    pub avg_fetch_latency_ns: u64,
}

impl CountersSnapshot {
    /// Render as a JSON object for external consumers.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_recording() {
        let counters = DsmCounters::new();
        counters.record_fault(false);
        counters.record_fault(true);
        counters.record_fault(true);

        let snap = counters.snapshot();
        assert_eq!(snap.page_faults, 3);
        assert_eq!(snap.read_faults, 1);
        assert_eq!(snap.write_faults, 2);
    }

    #[test]
    fn fetch_latency_moving_average() {
        let counters = DsmCounters::new();
        counters.record_fetch(800);
        assert_eq!(counters.snapshot().avg_fetch_latency_ns, 800);
        counters.record_fetch(1600);
        // (800 * 7 + 1600) / 8 = 900
        assert_eq!(counters.snapshot().avg_fetch_latency_ns, 900);
        assert_eq!(counters.snapshot().pages_fetched, 2);
    }

    #[test]
    fn reset_clears_everything() {
        let counters = DsmCounters::new();
        counters.record_fault(true);
        counters.record_fetch(500);
        counters.reset();
        assert_eq!(counters.snapshot(), CountersSnapshot::default());
    }

    #[test]
    fn snapshot_exports_json() {
        let counters = DsmCounters::new();
        counters.record_fault(false);
        let json = counters.snapshot().to_json();
        assert!(json.contains("\"page_faults\": 1"));
    }
}
