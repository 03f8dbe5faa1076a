//! Listener setup, accept loop and restart supervisor
//!
//! The supervisor owns the SOCKS5 listener. Each listener lifetime is a
//! "cycle" with its own child cancellation token; a restart request cancels
//! the cycle (dropping every connection task it spawned) and binds again
//! with the current configuration.

use crate::business::{ConfigStore, ServerStatsCollector};
use crate::config::ConnConfig;
use crate::core::Server;
use crate::handler::process_connection;
use crate::logger::log;

use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

/// TCP keepalive interval; dead peers are detected in ~45s (3 retries x 15s)
const TCP_KEEPALIVE_SECS: u64 = 15;

/// Back-off after a failed accept (e.g. EMFILE)
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Resolve `host:port` and bind a listener with SO_REUSEADDR for fast rebinds
pub async fn bind_listener(host: &str, port: u16, backlog: i32) -> std::io::Result<TcpListener> {
    let socket_addr = tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("no address for {}:{}", host, port),
            )
        })?;

    let socket = socket2::Socket::new(
        socket2::Domain::for_address(socket_addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&socket_addr.into())?;
    socket.listen(backlog)?;

    TcpListener::from_std(socket.into())
}

/// Admission gate on raw accepted sockets
///
/// The limit is read on every accept so config updates apply immediately.
#[derive(Debug, Clone, Default)]
pub struct ConnectionGate {
    active: Arc<AtomicUsize>,
}

/// Slot held for the lifetime of one accepted socket
#[derive(Debug)]
pub struct GatePermit {
    active: Arc<AtomicUsize>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ConnectionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a slot if fewer than `max` are in use
    pub fn try_acquire(&self, max: usize) -> Option<GatePermit> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()
            .map(|_| GatePermit {
                active: Arc::clone(&self.active),
            })
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// Token bucket for accepted connections
#[derive(Debug)]
struct TokenBucket {
    capacity: u32,
    tokens: u32,
    refill_interval: Duration,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_interval: Duration) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_interval,
            last_refill: Instant::now(),
        }
    }

    fn consume(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Restore one token per elapsed interval, keeping the remainder
    fn refill(&mut self, now: Instant) {
        let interval = self.refill_interval.as_nanos().max(1);
        let elapsed = now.saturating_duration_since(self.last_refill).as_nanos();
        let earned = elapsed / interval;
        if earned == 0 {
            return;
        }
        if self.tokens as u128 + earned >= self.capacity as u128 {
            self.tokens = self.capacity;
            self.last_refill = now;
        } else {
            self.tokens += earned as u32;
            self.last_refill += self.refill_interval * earned as u32;
        }
    }
}

/// Global accept-rate limit, shared across listener restarts
#[derive(Debug, Clone)]
pub struct AcceptRateLimiter {
    bucket: Arc<Mutex<TokenBucket>>,
}

impl AcceptRateLimiter {
    pub fn new(burst: u32, refill_interval: Duration) -> Self {
        Self {
            bucket: Arc::new(Mutex::new(TokenBucket::new(burst.max(1), refill_interval))),
        }
    }

    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&self, now: Instant) -> bool {
        self.bucket
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .consume(now)
    }
}

/// Admission checks applied to every accepted socket, in order
#[derive(Debug, Clone)]
pub struct Admission {
    pub rate: AcceptRateLimiter,
    pub gate: ConnectionGate,
}

impl Admission {
    pub fn new(conn_config: &ConnConfig) -> Self {
        Self {
            rate: AcceptRateLimiter::new(
                conn_config.accept_burst,
                conn_config.accept_refill_interval,
            ),
            gate: ConnectionGate::new(),
        }
    }
}

/// Run the accept loop until `cycle` is cancelled
///
/// Every connection task races its handler against `cycle`, so cancelling it
/// force-closes all connections accepted by this listener.
pub async fn serve(
    server: Arc<Server>,
    listener: TcpListener,
    admission: Admission,
    cycle: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = cycle.cancelled() => break,
        };

        match accepted {
            Ok((stream, peer)) => {
                if !admission.rate.allow() {
                    log::warn!(peer = %peer, "Accept rate limit exceeded, dropping");
                    drop(stream);
                    continue;
                }

                let max = server.policy.max_connections();
                let permit = match admission.gate.try_acquire(max) {
                    Some(permit) => permit,
                    None => {
                        log::warn!(peer = %peer, max_connections = max, "Connection limit reached, dropping");
                        drop(stream);
                        continue;
                    }
                };

                let peer_label = peer.to_string();
                log::connection(&peer_label, "new");

                let server = Arc::clone(&server);
                let cycle = cycle.clone();
                tokio::spawn(async move {
                    // Hold the slot for the lifetime of this connection
                    let _permit = permit;

                    if server.conn_config.tcp_nodelay {
                        let _ = stream.set_nodelay(true);
                    }
                    let keepalive = TcpKeepalive::new()
                        .with_time(Duration::from_secs(TCP_KEEPALIVE_SECS))
                        .with_interval(Duration::from_secs(TCP_KEEPALIVE_SECS));
                    let _ = SockRef::from(&stream).set_tcp_keepalive(&keepalive);

                    tokio::select! {
                        result = process_connection(&server, stream, peer) => {
                            if let Err(e) = result {
                                if e.is_auth_rejection() {
                                    log::info!(peer = %peer_label, error = %e, "Connection rejected");
                                } else {
                                    log::debug!(peer = %peer_label, error = %e, "Connection error");
                                }
                            }
                        }
                        _ = cycle.cancelled() => {
                            log::debug!(peer = %peer_label, "Connection closed by listener shutdown");
                        }
                    }
                    log::connection(&peer_label, "closed");
                });
            }
            Err(e) => {
                log::error!(error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

/// Cloneable trigger for listener restarts
#[derive(Debug, Clone, Default)]
pub struct RestartHandle {
    notify: Arc<Notify>,
}

impl RestartHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the supervisor to restart; coalesces with any pending request
    pub fn request(&self) {
        self.notify.notify_one();
    }

    async fn requested(&self) {
        self.notify.notified().await
    }
}

/// Owns the SOCKS5 listener across restarts
pub struct Supervisor {
    pub server: Arc<Server>,
    pub config: Arc<ConfigStore>,
    pub stats: Arc<ServerStatsCollector>,
    pub restart: RestartHandle,
    /// Currently bound address, `None` while stopped
    pub bound: watch::Sender<Option<SocketAddr>>,
}

impl Supervisor {
    /// Serve `listener`, then rebind on every restart request until `shutdown`
    pub async fn run(self, listener: TcpListener, shutdown: CancellationToken) {
        let admission = Admission::new(&self.server.conn_config);
        let mut listener = Some(listener);

        loop {
            match listener.take() {
                Some(active) => {
                    let addr = active.local_addr().ok();
                    let cycle = shutdown.child_token();
                    self.stats.set_running(true);
                    let _ = self.bound.send(addr);
                    log::info!(
                        address = ?addr,
                        max_connections = self.server.policy.max_connections(),
                        "SOCKS5 listener started"
                    );

                    let serve_task = tokio::spawn(serve(
                        Arc::clone(&self.server),
                        active,
                        admission.clone(),
                        cycle.clone(),
                    ));

                    let restarting = tokio::select! {
                        _ = self.restart.requested() => true,
                        _ = shutdown.cancelled() => false,
                    };

                    cycle.cancel();
                    let _ = serve_task.await;
                    let closed = self.server.sessions.close_all();
                    self.stats.set_running(false);
                    let _ = self.bound.send(None);
                    log::info!(closed_sessions = closed, "SOCKS5 listener stopped");

                    if !restarting {
                        return;
                    }
                }
                None => {
                    // Stopped after a failed rebind; wait for the next request
                    tokio::select! {
                        _ = self.restart.requested() => {}
                        _ = shutdown.cancelled() => return,
                    }
                }
            }

            let config = self.config.current();
            match bind_listener(
                &config.host,
                config.port,
                self.server.conn_config.tcp_backlog,
            )
            .await
            {
                Ok(next) => listener = Some(next),
                Err(e) => {
                    log::error!(
                        host = %config.host,
                        port = config.port,
                        error = %e,
                        "Failed to rebind SOCKS5 listener, server stopped"
                    );
                }
            }
        }
    }
}
