//! Server-wide statistics collection

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::core::hooks::{DenyReason, StatsCollector};
use crate::logger::log;

/// Point-in-time counter values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub rejected_auth: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Process-wide counters plus listener status
#[derive(Debug)]
pub struct ServerStatsCollector {
    started_at: SystemTime,
    started: Instant,
    running: AtomicBool,
    rejected_auth: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl Default for ServerStatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerStatsCollector {
    pub fn new() -> Self {
        Self {
            started_at: SystemTime::now(),
            started: Instant::now(),
            running: AtomicBool::new(false),
            rejected_auth: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        }
    }

    /// Seconds since the process started
    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Unix timestamp of process start
    pub fn start_time_unix(&self) -> u64 {
        self.started_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Whether the SOCKS5 listener is currently bound
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn counters(&self) -> CounterSnapshot {
        CounterSnapshot {
            rejected_auth: self.rejected_auth.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }
}

impl StatsCollector for ServerStatsCollector {
    fn record_rejection(&self, reason: DenyReason) {
        self.rejected_auth.fetch_add(1, Ordering::Relaxed);
        log::debug!(reason = %reason, "Authentication rejected");
    }

    fn record_upload(&self, bytes: u64) {
        self.bytes_in.fetch_add(bytes, Ordering::Relaxed);
    }

    fn record_download(&self, bytes: u64) {
        self.bytes_out.fetch_add(bytes, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_stats_collector_new() {
        let stats = ServerStatsCollector::new();
        assert!(!stats.is_running());
        assert_eq!(
            stats.counters(),
            CounterSnapshot {
                rejected_auth: 0,
                bytes_in: 0,
                bytes_out: 0
            }
        );
        assert!(stats.start_time_unix() > 0);
        assert_eq!(stats.uptime_secs(), 0);
    }

    #[test]
    fn test_stats_collector_records() {
        let stats = ServerStatsCollector::new();
        stats.record_upload(100);
        stats.record_upload(50);
        stats.record_download(200);
        stats.record_rejection(DenyReason::BadCredentials);
        stats.record_rejection(DenyReason::Blacklisted);

        let c = stats.counters();
        assert_eq!(c.bytes_in, 150);
        assert_eq!(c.bytes_out, 200);
        assert_eq!(c.rejected_auth, 2);
    }

    #[test]
    fn test_running_flag() {
        let stats = ServerStatsCollector::new();
        stats.set_running(true);
        assert!(stats.is_running());
        stats.set_running(false);
        assert!(!stats.is_running());
    }

    #[test]
    fn test_stats_collector_concurrent() {
        use std::thread;

        let stats = Arc::new(ServerStatsCollector::new());
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let s = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        s.record_upload(1);
                        s.record_download(2);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let c = stats.counters();
        assert_eq!(c.bytes_in, 10_000);
        assert_eq!(c.bytes_out, 20_000);
    }
}
