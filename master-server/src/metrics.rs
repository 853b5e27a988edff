//! Lightweight Prometheus-compatible metrics for the master server.
//!
//! Uses atomic counters for lock-free instrumentation. Renders metrics in
//! Prometheus text exposition format; the server logs a snapshot
//! periodically and on shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Lightweight Prometheus-compatible metrics for the master server.
pub struct Metrics {
    /// Live sessions (gauge)
    pub active_sessions: AtomicU64,
    /// Server registrations and refreshes (counter)
    pub registrations_total: AtomicU64,
    /// Description updates applied (counter)
    pub server_updates_total: AtomicU64,
    /// Server listings served (counter)
    pub list_requests_total: AtomicU64,
    /// NAT punch requests received (counter)
    pub nat_punch_requests_total: AtomicU64,
    /// NAT candidates handed to polling servers (counter)
    pub nat_candidates_drained_total: AtomicU64,
    /// NAT candidates dropped at the per-server cap (counter)
    pub nat_candidates_dropped_total: AtomicU64,
    /// Connections rejected for an unrecognized handshake value (counter)
    pub handshake_rejections_total: AtomicU64,
    /// Connections closed over malformed packets (counter)
    pub malformed_packets_total: AtomicU64,
    /// Connections closed by the session deadline sweep (counter)
    pub expired_sessions_total: AtomicU64,
    /// Server start time (for uptime calculation)
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            active_sessions: AtomicU64::new(0),
            registrations_total: AtomicU64::new(0),
            server_updates_total: AtomicU64::new(0),
            list_requests_total: AtomicU64::new(0),
            nat_punch_requests_total: AtomicU64::new(0),
            nat_candidates_drained_total: AtomicU64::new(0),
            nat_candidates_dropped_total: AtomicU64::new(0),
            handshake_rejections_total: AtomicU64::new(0),
            malformed_packets_total: AtomicU64::new(0),
            expired_sessions_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP master_active_sessions Current number of live sessions\n\
             # TYPE master_active_sessions gauge\n\
             master_active_sessions {}\n\
             # HELP master_registrations_total Total server registrations and refreshes\n\
             # TYPE master_registrations_total counter\n\
             master_registrations_total {}\n\
             # HELP master_server_updates_total Total description updates applied\n\
             # TYPE master_server_updates_total counter\n\
             master_server_updates_total {}\n\
             # HELP master_list_requests_total Total server listings served\n\
             # TYPE master_list_requests_total counter\n\
             master_list_requests_total {}\n\
             # HELP master_nat_punch_requests_total Total NAT punch requests received\n\
             # TYPE master_nat_punch_requests_total counter\n\
             master_nat_punch_requests_total {}\n\
             # HELP master_nat_candidates_drained_total Total NAT candidates handed to servers\n\
             # TYPE master_nat_candidates_drained_total counter\n\
             master_nat_candidates_drained_total {}\n\
             # HELP master_nat_candidates_dropped_total Total NAT candidates dropped at the cap\n\
             # TYPE master_nat_candidates_dropped_total counter\n\
             master_nat_candidates_dropped_total {}\n\
             # HELP master_handshake_rejections_total Total connections rejected at accept\n\
             # TYPE master_handshake_rejections_total counter\n\
             master_handshake_rejections_total {}\n\
             # HELP master_malformed_packets_total Total connections closed over malformed packets\n\
             # TYPE master_malformed_packets_total counter\n\
             master_malformed_packets_total {}\n\
             # HELP master_expired_sessions_total Total connections closed by the deadline sweep\n\
             # TYPE master_expired_sessions_total counter\n\
             master_expired_sessions_total {}\n\
             # HELP master_uptime_seconds Server uptime in seconds\n\
             # TYPE master_uptime_seconds gauge\n\
             master_uptime_seconds {}\n",
            self.active_sessions.load(Ordering::Relaxed),
            self.registrations_total.load(Ordering::Relaxed),
            self.server_updates_total.load(Ordering::Relaxed),
            self.list_requests_total.load(Ordering::Relaxed),
            self.nat_punch_requests_total.load(Ordering::Relaxed),
            self.nat_candidates_drained_total.load(Ordering::Relaxed),
            self.nat_candidates_dropped_total.load(Ordering::Relaxed),
            self.handshake_rejections_total.load(Ordering::Relaxed),
            self.malformed_packets_total.load(Ordering::Relaxed),
            self.expired_sessions_total.load(Ordering::Relaxed),
            uptime,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
