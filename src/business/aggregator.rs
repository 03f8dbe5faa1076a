//! Read/write views over server counters and configuration

use serde::Serialize;
use std::sync::Arc;

use super::config_store::ConfigStore;
use super::stats::ServerStatsCollector;
use crate::config::{ConfigUpdate, ConfigView};
use crate::core::SessionTable;
use crate::error::ProxyError;

/// Listener status as reported to the dashboard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    pub connections: usize,
    pub total_connections: u64,
    /// Seconds since process start
    pub uptime: u64,
    /// Unix seconds
    pub start_time: u64,
    pub status: ServerStatus,
    pub rejected_auth: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Ties together the session table, counters and config store
#[derive(Clone)]
pub struct Aggregator {
    sessions: SessionTable,
    stats: Arc<ServerStatsCollector>,
    config: Arc<ConfigStore>,
}

impl Aggregator {
    pub fn new(
        sessions: SessionTable,
        stats: Arc<ServerStatsCollector>,
        config: Arc<ConfigStore>,
    ) -> Self {
        Self {
            sessions,
            stats,
            config,
        }
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn stats(&self) -> &Arc<ServerStatsCollector> {
        &self.stats
    }

    pub fn status(&self) -> ServerStatus {
        if self.stats.is_running() {
            ServerStatus::Running
        } else {
            ServerStatus::Stopped
        }
    }

    pub fn current_stats(&self) -> ServerStats {
        let counters = self.stats.counters();
        ServerStats {
            connections: self.sessions.len(),
            total_connections: self.sessions.total_created(),
            uptime: self.stats.uptime_secs(),
            start_time: self.stats.start_time_unix(),
            status: self.status(),
            rejected_auth: counters.rejected_auth,
            bytes_in: counters.bytes_in,
            bytes_out: counters.bytes_out,
        }
    }

    pub fn current_config(&self) -> ConfigView {
        ConfigView::from(self.config.current().as_ref())
    }

    pub fn update_config(&self, update: &ConfigUpdate) -> Result<ConfigView, ProxyError> {
        let next = self.config.update(update)?;
        Ok(ConfigView::from(next.as_ref()))
    }
}
