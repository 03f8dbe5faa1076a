//! Hook traits for extensibility
//!
//! Defines the extension points that let the business layer inject
//! authentication policy, statistics and outbound routing into the proxy core.

use crate::core::protocol::{PasswordAuthRequest, METHOD_NO_AUTH, METHOD_USER_PASS};
use crate::core::Address;
use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

/// Authentication methods the server can offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    /// 0x00, no authentication
    NoAuth,
    /// 0x02, RFC 1929 username/password
    UserPass,
}

impl AuthMethod {
    /// Method byte on the wire
    pub fn code(self) -> u8 {
        match self {
            AuthMethod::NoAuth => METHOD_NO_AUTH,
            AuthMethod::UserPass => METHOD_USER_PASS,
        }
    }

    /// Label shown by the dashboard
    pub fn label(self) -> &'static str {
        match self {
            AuthMethod::NoAuth => "无认证",
            AuthMethod::UserPass => "用户名密码认证",
        }
    }
}

impl FromStr for AuthMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "无认证" | "none" | "no-auth" | "0" => Ok(AuthMethod::NoAuth),
            "用户名密码认证" | "password" | "username-password" | "2" => Ok(AuthMethod::UserPass),
            other => Err(format!("unknown auth method: {}", other)),
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why a client was turned away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// Client address is on the blacklist
    Blacklisted,
    /// None of the offered methods is enabled
    NoAcceptableMethod,
    /// Username or password mismatch
    BadCredentials,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::Blacklisted => f.write_str("blacklisted"),
            DenyReason::NoAcceptableMethod => f.write_str("no acceptable method"),
            DenyReason::BadCredentials => f.write_str("bad credentials"),
        }
    }
}

/// Outcome of an authorization check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Authorized,
    Denied(DenyReason),
}

impl AuthDecision {
    pub fn is_authorized(&self) -> bool {
        matches!(self, AuthDecision::Authorized)
    }
}

/// Authentication policy for a single connection
///
/// Synchronous: every check is an in-memory lookup against a config snapshot.
pub trait Authenticator: Send + Sync {
    /// Reject blacklisted clients before any protocol bytes are read
    fn check_client(&self, ip: &std::net::IpAddr) -> AuthDecision;

    /// Pick a method from the client's offer in server priority order
    fn select_method(&self, offered: &[u8]) -> Option<AuthMethod>;

    /// Verify the client once a method is selected
    fn authenticate(
        &self,
        ip: &std::net::IpAddr,
        method: AuthMethod,
        credentials: Option<&PasswordAuthRequest>,
    ) -> AuthDecision;
}

/// Source of the live server policy
///
/// Each accepted connection takes one snapshot and uses it throughout, so
/// policy changes never alter a connection that is already in progress.
pub trait PolicySource: Send + Sync {
    fn snapshot(&self) -> Arc<dyn Authenticator>;

    /// Current admission limit for raw accepted sockets
    fn max_connections(&self) -> usize;
}

/// Statistics collector trait for server-wide counters
pub trait StatsCollector: Send + Sync {
    /// Record a rejected authentication attempt
    fn record_rejection(&self, reason: DenyReason);
    /// Record upload bytes (client -> target)
    fn record_upload(&self, bytes: u64);
    /// Record download bytes (target -> client)
    fn record_download(&self, bytes: u64);
}

/// Outbound router trait for routing decisions
#[async_trait]
pub trait OutboundRouter: Send + Sync {
    /// Route based on target address
    async fn route(&self, addr: &Address) -> OutboundType;
}

/// Outbound type for routing decisions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundType {
    /// Direct connection. Addresses the router already resolved are tried in
    /// order; an empty list means the handler resolves the target itself.
    Direct(Vec<SocketAddr>),
    /// Refuse the target
    Reject,
}

/// Routes everything directly, optionally refusing private targets
#[derive(Debug, Default)]
pub struct DirectRouter {
    block_private_targets: bool,
}

impl DirectRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_block_private_targets(block_private_targets: bool) -> Self {
        Self {
            block_private_targets,
        }
    }
}

#[async_trait]
impl OutboundRouter for DirectRouter {
    async fn route(&self, addr: &Address) -> OutboundType {
        if !self.block_private_targets {
            return OutboundType::Direct(Vec::new());
        }
        match check_private_and_resolve(addr).await {
            (true, _) => OutboundType::Reject,
            (false, resolved) => OutboundType::Direct(resolved),
        }
    }
}

/// Check whether an address is private. For domains, also return every
/// resolved address so callers can reuse them.
pub(crate) async fn check_private_and_resolve(addr: &Address) -> (bool, Vec<SocketAddr>) {
    use super::ip_filter::is_private_ip;

    match addr {
        Address::IPv4(..) | Address::IPv6(..) => match addr.to_socket_addr().await {
            Ok(sa) => (is_private_ip(&sa.ip()), Vec::new()),
            Err(_) => (false, Vec::new()),
        },
        Address::Domain(domain, port) => {
            let resolved: Vec<SocketAddr> =
                match tokio::net::lookup_host((domain.as_str(), *port)).await {
                    Ok(addrs) => addrs.collect(),
                    Err(_) => return (false, Vec::new()),
                };
            if resolved.iter().any(|sa| is_private_ip(&sa.ip())) {
                return (true, Vec::new());
            }
            (false, resolved)
        }
    }
}
