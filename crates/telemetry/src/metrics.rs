//! Telemetry collection metrics.
//!
//! Counters describing how the coalescers are behaving: how many rounds go
//! out to the network, how often the cache absorbs a query, and how peers
//! fail to answer. One [`TelemetryMetrics`] is shared by a coordinator and
//! every coalescer it creates.
//!
//! # Thread Safety
//!
//! All metrics use atomic operations and are safe to access from multiple threads.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter for simple metrics.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter starting at 0.
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters for telemetry collection.
#[derive(Debug, Default)]
pub struct TelemetryMetrics {
    /// Request rounds sent to the network.
    pub rounds_started: Counter,
    /// Queries answered from cache.
    pub cache_hits: Counter,
    /// Telemetry requests handed to peer channels.
    pub requests_sent: Counter,
    /// Requests whose send completion reported an error.
    pub send_failures: Counter,
    /// Peers that did not answer before their round timed out.
    pub timeouts: Counter,
    /// Reports that counted towards a round.
    pub reports_accepted: Counter,
    /// Reports that arrived for no outstanding request.
    pub reports_ignored: Counter,
    /// Single-peer entries dropped by idle cleanup.
    pub single_requests_evicted: Counter,
}

impl TelemetryMetrics {
    /// Create a zeroed metrics set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a point-in-time copy of all counters.
    pub fn snapshot(&self) -> TelemetryMetricsSnapshot {
        TelemetryMetricsSnapshot {
            rounds_started: self.rounds_started.get(),
            cache_hits: self.cache_hits.get(),
            requests_sent: self.requests_sent.get(),
            send_failures: self.send_failures.get(),
            timeouts: self.timeouts.get(),
            reports_accepted: self.reports_accepted.get(),
            reports_ignored: self.reports_ignored.get(),
            single_requests_evicted: self.single_requests_evicted.get(),
        }
    }
}

/// Point-in-time copy of [`TelemetryMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetryMetricsSnapshot {
    pub rounds_started: u64,
    pub cache_hits: u64,
    pub requests_sent: u64,
    pub send_failures: u64,
    pub timeouts: u64,
    pub reports_accepted: u64,
    pub reports_ignored: u64,
    pub single_requests_evicted: u64,
}
