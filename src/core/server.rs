//! Core proxy server
//!
//! The Server struct bundles the hooks and shared state every connection task needs.

use std::sync::Arc;

use super::hooks::{DirectRouter, OutboundRouter, PolicySource, StatsCollector};
use super::session::SessionTable;
use crate::config::ConnConfig;
use crate::error::ProxyError;

/// Core proxy server
pub struct Server {
    /// Live authentication policy and admission limit
    pub policy: Arc<dyn PolicySource>,
    /// Statistics collector
    pub stats: Arc<dyn StatsCollector>,
    /// Outbound router for CONNECT targets
    pub router: Arc<dyn OutboundRouter>,
    /// Active sessions
    pub sessions: SessionTable,
    /// Connection performance configuration
    pub conn_config: ConnConfig,
}

impl Server {
    /// Create a new server builder
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }
}

/// Builder for constructing a Server
#[derive(Default)]
pub struct ServerBuilder {
    policy: Option<Arc<dyn PolicySource>>,
    stats: Option<Arc<dyn StatsCollector>>,
    router: Option<Arc<dyn OutboundRouter>>,
    sessions: Option<SessionTable>,
    conn_config: Option<ConnConfig>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn policy(mut self, policy: Arc<dyn PolicySource>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn stats(mut self, stats: Arc<dyn StatsCollector>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn router(mut self, router: Arc<dyn OutboundRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn sessions(mut self, sessions: SessionTable) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn conn_config(mut self, config: ConnConfig) -> Self {
        self.conn_config = Some(config);
        self
    }

    /// Build the server. Policy and stats are required; the rest default.
    pub fn build(self) -> Result<Server, ProxyError> {
        Ok(Server {
            policy: self
                .policy
                .ok_or_else(|| ProxyError::Config("policy source is required".into()))?,
            stats: self
                .stats
                .ok_or_else(|| ProxyError::Config("stats collector is required".into()))?,
            router: self.router.unwrap_or_else(|| Arc::new(DirectRouter::new())),
            sessions: self.sessions.unwrap_or_default(),
            conn_config: self.conn_config.unwrap_or_default(),
        })
    }
}
