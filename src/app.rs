//! Process wiring
//!
//! Builds the shared state once, binds both listeners and spawns the
//! SOCKS5 supervisor and the management API. Startup bind failures are
//! returned to the caller.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{self, ApiState, DEFAULT_TEST_TIMEOUT};
use crate::business::{Aggregator, ConfigStore, ServerStatsCollector};
use crate::config::AppConfig;
use crate::core::hooks::{DirectRouter, PolicySource, StatsCollector};
use crate::core::{Server, SessionTable};
use crate::logger::{log, LogBuffer};
use crate::server_runner::{bind_listener, RestartHandle, Supervisor};

/// Running proxy plus management API
pub struct App {
    aggregator: Aggregator,
    restart: RestartHandle,
    shutdown: CancellationToken,
    socks_addr: watch::Receiver<Option<SocketAddr>>,
    admin_addr: SocketAddr,
    supervisor: JoinHandle<()>,
    admin: JoinHandle<std::io::Result<()>>,
}

impl App {
    pub async fn start(config: AppConfig, logs: LogBuffer) -> Result<Self> {
        let sessions = SessionTable::new();
        let stats = Arc::new(ServerStatsCollector::new());
        let store = Arc::new(ConfigStore::new(config.server.clone()));

        let server = Arc::new(
            Server::builder()
                .policy(Arc::clone(&store) as Arc<dyn PolicySource>)
                .stats(Arc::clone(&stats) as Arc<dyn StatsCollector>)
                .router(Arc::new(DirectRouter::with_block_private_targets(
                    config.block_private_targets,
                )))
                .sessions(sessions.clone())
                .conn_config(config.conn)
                .build()?,
        );

        let socks_listener = bind_listener(
            &config.server.host,
            config.server.port,
            config.conn.tcp_backlog,
        )
        .await
        .with_context(|| {
            format!(
                "failed to bind SOCKS5 listener on {}:{}",
                config.server.host, config.server.port
            )
        })?;

        let admin_listener = TcpListener::bind((config.admin.host.as_str(), config.admin.port))
            .await
            .with_context(|| {
                format!(
                    "failed to bind management API on {}:{}",
                    config.admin.host, config.admin.port
                )
            })?;
        let admin_addr = admin_listener.local_addr()?;

        if config.admin.token.is_none() {
            log::warn!(
                address = %admin_addr,
                "Management API has no token configured, requests are not authenticated"
            );
        }

        let shutdown = CancellationToken::new();
        let restart = RestartHandle::new();
        let aggregator = Aggregator::new(sessions, Arc::clone(&stats), Arc::clone(&store));
        let (bound_tx, bound_rx) = watch::channel(socks_listener.local_addr().ok());

        let supervisor = Supervisor {
            server,
            config: store,
            stats,
            restart: restart.clone(),
            bound: bound_tx,
        };
        let supervisor = tokio::spawn(supervisor.run(socks_listener, shutdown.clone()));

        let api_state = ApiState {
            aggregator: aggregator.clone(),
            logs,
            restart: restart.clone(),
            token: config.admin.token.as_deref().map(Arc::from),
            test_timeout: DEFAULT_TEST_TIMEOUT,
        };
        let admin = tokio::spawn(api::serve(admin_listener, api_state, shutdown.clone()));

        Ok(Self {
            aggregator,
            restart,
            shutdown,
            socks_addr: bound_rx,
            admin_addr,
            supervisor,
            admin,
        })
    }

    /// Address of the SOCKS5 listener, `None` while stopped
    pub fn socks_addr(&self) -> Option<SocketAddr> {
        *self.socks_addr.borrow()
    }

    pub fn admin_addr(&self) -> SocketAddr {
        self.admin_addr
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn restart_handle(&self) -> RestartHandle {
        self.restart.clone()
    }

    /// Stop both listeners and wait for them to wind down
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.supervisor.await {
            log::error!(error = %e, "SOCKS5 supervisor task failed");
        }
        match self.admin.await {
            Ok(Err(e)) => log::error!(error = %e, "Management API stopped with error"),
            Err(e) => log::error!(error = %e, "Management API task failed"),
            Ok(Ok(())) => {}
        }
    }
}
