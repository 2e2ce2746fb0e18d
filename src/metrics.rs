//! Lightweight Prometheus-compatible counters for the forwarder.
//!
//! Atomic counters for lock-free instrumentation, rendered in Prometheus
//! text exposition format. The server logs the rendered block once at
//! shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct Metrics {
    /// Total connections accepted across all routes (counter)
    pub accepted_total: AtomicU64,
    /// Total connections dropped because the pool was full (counter)
    pub dropped_total: AtomicU64,
    /// Total backend connect attempts that failed outright (counter)
    pub connect_failures_total: AtomicU64,
    /// Total connections closed (EOF or I/O error on either leg) (counter)
    pub closed_total: AtomicU64,
    /// Total bytes relayed client -> backend (counter)
    pub bytes_out_total: AtomicU64,
    /// Total bytes relayed backend -> client (counter)
    pub bytes_in_total: AtomicU64,
    /// Server start time (for uptime calculation)
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            accepted_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            connect_failures_total: AtomicU64::new(0),
            closed_total: AtomicU64::new(0),
            bytes_out_total: AtomicU64::new(0),
            bytes_in_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Render counters in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP multiproxy_accepted_total Total connections accepted\n\
             # TYPE multiproxy_accepted_total counter\n\
             multiproxy_accepted_total {}\n\
             # HELP multiproxy_dropped_total Connections dropped (pool full)\n\
             # TYPE multiproxy_dropped_total counter\n\
             multiproxy_dropped_total {}\n\
             # HELP multiproxy_connect_failures_total Backend connect failures\n\
             # TYPE multiproxy_connect_failures_total counter\n\
             multiproxy_connect_failures_total {}\n\
             # HELP multiproxy_closed_total Connections closed\n\
             # TYPE multiproxy_closed_total counter\n\
             multiproxy_closed_total {}\n\
             # HELP multiproxy_bytes_out_total Bytes relayed client to backend\n\
             # TYPE multiproxy_bytes_out_total counter\n\
             multiproxy_bytes_out_total {}\n\
             # HELP multiproxy_bytes_in_total Bytes relayed backend to client\n\
             # TYPE multiproxy_bytes_in_total counter\n\
             multiproxy_bytes_in_total {}\n\
             # HELP multiproxy_uptime_seconds Forwarder uptime in seconds\n\
             # TYPE multiproxy_uptime_seconds gauge\n\
             multiproxy_uptime_seconds {}\n",
            self.accepted_total.load(Ordering::Relaxed),
            self.dropped_total.load(Ordering::Relaxed),
            self.connect_failures_total.load(Ordering::Relaxed),
            self.closed_total.load(Ordering::Relaxed),
            self.bytes_out_total.load(Ordering::Relaxed),
            self.bytes_in_total.load(Ordering::Relaxed),
            uptime,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
