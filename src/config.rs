//! Configuration module for the SOCKS5 server
//!
//! CLI arguments (with environment variable fallbacks) are layered over an
//! optional TOML file. The SOCKS5 part of the result is the runtime
//! [`ServerConfig`], which the management API can later replace through a
//! validated [`ConfigUpdate`].

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::hooks::AuthMethod;
use crate::core::ip_filter::Blacklist;
use crate::error::ProxyError;

/// Parse duration string (e.g., "60s", "2m", "1h") or plain seconds
pub(crate) fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '60s', '2m', '1h' or plain seconds",
            s
        )
    })
}

pub const DEFAULT_SOCKS5_HOST: &str = "0.0.0.0";
pub const DEFAULT_SOCKS5_PORT: u16 = 1080;
pub const DEFAULT_ADMIN_HOST: &str = "127.0.0.1";
pub const DEFAULT_ADMIN_PORT: u16 = 8080;
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// CLI arguments for the SOCKS5 server
///
/// Supports environment variables with X_SOCKS5_ prefix
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "SOCKS5 proxy server with management API")]
#[command(rename_all = "snake_case")]
pub struct CliArgs {
    /// TOML configuration file
    #[arg(long, env = "X_SOCKS5_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// SOCKS5 listen host (overrides the config file)
    #[arg(long, env = "X_SOCKS5_HOST")]
    pub host: Option<String>,

    /// SOCKS5 listen port (overrides the config file)
    #[arg(long, env = "X_SOCKS5_PORT")]
    pub port: Option<u16>,

    /// Management API listen host (default: 127.0.0.1)
    #[arg(long, env = "X_SOCKS5_ADMIN_HOST")]
    pub admin_host: Option<String>,

    /// Management API listen port (default: 8080)
    #[arg(long, env = "X_SOCKS5_ADMIN_PORT")]
    pub admin_port: Option<u16>,

    /// Bearer token required by /api/* routes
    #[arg(long, env = "X_SOCKS5_ADMIN_TOKEN")]
    pub admin_token: Option<String>,

    /// Log mode: trace, debug, info, warn, error (default: info)
    #[arg(long, env = "X_SOCKS5_LOG_MODE")]
    pub log_mode: Option<String>,

    /// Number of log lines retained for /api/logs
    #[arg(long, env = "X_SOCKS5_LOG_CAPACITY", default_value_t = DEFAULT_LOG_CAPACITY)]
    pub log_capacity: usize,

    /// Refuse CONNECT requests to private/loopback targets
    #[arg(long, env = "X_SOCKS5_BLOCK_PRIVATE_TARGETS", default_value_t = false)]
    pub block_private_targets: bool,

    // ==================== Performance Tuning ====================
    /// Connection idle timeout - disconnect if no data transferred (default: 5m)
    #[arg(long, env = "X_SOCKS5_CONN_IDLE_TIMEOUT", default_value = "5m", value_parser = parse_duration, help_heading = "Performance")]
    pub conn_idle_timeout: Duration,

    /// TCP connect timeout to target server (default: 10s)
    #[arg(long, env = "X_SOCKS5_TCP_CONNECT_TIMEOUT", default_value = "10s", value_parser = parse_duration, help_heading = "Performance")]
    pub tcp_connect_timeout: Duration,

    /// Timeout for each handshake phase (default: 10s)
    #[arg(long, env = "X_SOCKS5_REQUEST_TIMEOUT", default_value = "10s", value_parser = parse_duration, help_heading = "Performance")]
    pub request_timeout: Duration,

    /// Handshake buffer size in bytes (default: 4KB)
    #[arg(long, env = "X_SOCKS5_BUFFER_SIZE", default_value_t = 4 * 1024, help_heading = "Performance")]
    pub buffer_size: usize,

    /// TCP listen backlog for pending connections (default: 1024)
    #[arg(
        long,
        env = "X_SOCKS5_TCP_BACKLOG",
        default_value_t = 1024,
        help_heading = "Performance"
    )]
    pub tcp_backlog: i32,

    /// Enable TCP_NODELAY for lower latency (default: true)
    #[arg(
        long,
        env = "X_SOCKS5_TCP_NODELAY",
        default_value_t = true,
        help_heading = "Performance"
    )]
    pub tcp_nodelay: bool,

    /// Accepts allowed in a burst before rate limiting kicks in (default: 1000)
    #[arg(
        long,
        env = "X_SOCKS5_ACCEPT_BURST",
        default_value_t = 1000,
        help_heading = "Performance"
    )]
    pub accept_burst: u32,

    /// Interval at which one accept token is restored (default: 100ms)
    #[arg(long, env = "X_SOCKS5_ACCEPT_REFILL_INTERVAL", default_value = "100ms", value_parser = parse_duration, help_heading = "Performance")]
    pub accept_refill_interval: Duration,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the CLI arguments
    pub fn validate(&self) -> Result<()> {
        if let Some(ref path) = self.config_file {
            if !path.exists() {
                return Err(anyhow!("Config file not found: {}", path.display()));
            }
        }
        if matches!(self.port, Some(0)) {
            return Err(anyhow!("SOCKS5 port must be in 1..=65535"));
        }
        if matches!(self.host.as_deref(), Some("")) {
            return Err(anyhow!("SOCKS5 host must not be empty"));
        }
        if self.log_capacity == 0 {
            return Err(anyhow!("log_capacity must be greater than 0"));
        }
        if self.conn_idle_timeout.is_zero() {
            return Err(anyhow!("conn_idle_timeout must be greater than 0"));
        }
        if self.tcp_connect_timeout.is_zero() {
            return Err(anyhow!("tcp_connect_timeout must be greater than 0"));
        }
        if self.request_timeout.is_zero() {
            return Err(anyhow!("request_timeout must be greater than 0"));
        }
        if self.buffer_size < 512 {
            return Err(anyhow!("buffer_size must be at least 512 bytes"));
        }
        if self.tcp_backlog <= 0 {
            return Err(anyhow!("tcp_backlog must be greater than 0"));
        }
        if self.accept_burst == 0 {
            return Err(anyhow!("accept_burst must be greater than 0"));
        }
        if self.accept_refill_interval.is_zero() {
            return Err(anyhow!("accept_refill_interval must be greater than 0"));
        }
        Ok(())
    }
}

/// Connection performance configuration
#[derive(Debug, Clone, Copy)]
pub struct ConnConfig {
    /// Connection idle timeout
    pub idle_timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Per-phase handshake timeout
    pub request_timeout: Duration,
    /// Initial handshake buffer capacity
    pub buffer_size: usize,
    /// TCP listen backlog
    pub tcp_backlog: i32,
    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,
    /// Accept token bucket capacity
    pub accept_burst: u32,
    /// One accept token restored per interval
    pub accept_refill_interval: Duration,
}

impl ConnConfig {
    /// Create from CLI args
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self {
            idle_timeout: cli.conn_idle_timeout,
            connect_timeout: cli.tcp_connect_timeout,
            request_timeout: cli.request_timeout,
            buffer_size: cli.buffer_size,
            tcp_backlog: cli.tcp_backlog,
            tcp_nodelay: cli.tcp_nodelay,
            accept_burst: cli.accept_burst,
            accept_refill_interval: cli.accept_refill_interval,
        }
    }
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            buffer_size: 4 * 1024,
            tcp_backlog: 1024,
            tcp_nodelay: true,
            accept_burst: 1000,
            accept_refill_interval: Duration::from_millis(100),
        }
    }
}

// ==================== Config file ====================

/// `[socks5]` section of the config file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Socks5Section {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub auth_methods: Option<Vec<String>>,
    pub max_connections: Option<usize>,
    pub blacklist: Option<Vec<String>>,
}

/// `[admin]` section of the config file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdminSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub token: Option<String>,
}

/// `[log]` section of the config file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogSection {
    pub level: Option<String>,
}

/// On-disk configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub socks5: Socks5Section,
    pub admin: AdminSection,
    pub log: LogSection,
}

impl FileConfig {
    /// Load and parse a TOML config file
    pub fn load(path: &Path) -> std::result::Result<Self, ProxyError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

// ==================== Runtime configuration ====================

/// SOCKS5 runtime configuration; replaced wholesale on update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Enabled methods in server priority order
    pub auth_methods: Vec<AuthMethod>,
    pub max_connections: usize,
    pub blacklist: Blacklist,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_SOCKS5_HOST.to_string(),
            port: DEFAULT_SOCKS5_PORT,
            user: String::new(),
            password: String::new(),
            auth_methods: vec![AuthMethod::NoAuth],
            max_connections: DEFAULT_MAX_CONNECTIONS,
            blacklist: Blacklist::default(),
        }
    }
}

impl ServerConfig {
    /// Check cross-field invariants
    pub fn validate(&self) -> std::result::Result<(), ProxyError> {
        if self.host.trim().is_empty() {
            return Err(ProxyError::Validation("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(ProxyError::Validation("port must be in 1..=65535".into()));
        }
        if self.max_connections == 0 {
            return Err(ProxyError::Validation(
                "maxConnections must be greater than 0".into(),
            ));
        }
        if self.auth_methods.is_empty() {
            return Err(ProxyError::Validation(
                "authMethods must not be empty".into(),
            ));
        }
        if self.auth_methods.contains(&AuthMethod::UserPass) && self.user.is_empty() {
            return Err(ProxyError::Validation(
                "user must be set when username/password authentication is enabled".into(),
            ));
        }
        Ok(())
    }

    /// Build from the `[socks5]` section, falling back to defaults
    fn from_section(section: &Socks5Section) -> std::result::Result<Self, ProxyError> {
        let defaults = Self::default();
        let auth_methods = match &section.auth_methods {
            Some(labels) => parse_auth_methods(labels)?,
            None => defaults.auth_methods,
        };
        let blacklist = match &section.blacklist {
            Some(entries) => Blacklist::parse(entries).map_err(ProxyError::Validation)?,
            None => defaults.blacklist,
        };
        Ok(Self {
            host: section.host.clone().unwrap_or(defaults.host),
            port: section.port.unwrap_or(defaults.port),
            user: section.user.clone().unwrap_or_default(),
            password: section.password.clone().unwrap_or_default(),
            auth_methods,
            max_connections: section.max_connections.unwrap_or(defaults.max_connections),
            blacklist,
        })
    }
}

fn parse_auth_methods(labels: &[String]) -> std::result::Result<Vec<AuthMethod>, ProxyError> {
    let mut methods = Vec::with_capacity(labels.len());
    for label in labels {
        let method: AuthMethod = label.parse().map_err(ProxyError::Validation)?;
        if !methods.contains(&method) {
            methods.push(method);
        }
    }
    Ok(methods)
}

/// Partial update accepted by `PUT /api/config`
///
/// Numeric fields are signed so that negative values reach validation
/// instead of failing deserialization.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    pub host: Option<String>,
    pub port: Option<i64>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub auth_methods: Option<Vec<String>>,
    pub max_connections: Option<i64>,
    pub black_list: Option<Vec<String>>,
}

impl ConfigUpdate {
    /// Apply on top of `base`, producing a validated new config.
    /// `base` is never modified.
    pub fn apply(&self, base: &ServerConfig) -> std::result::Result<ServerConfig, ProxyError> {
        let mut next = base.clone();

        if let Some(ref host) = self.host {
            next.host = host.trim().to_string();
        }
        if let Some(port) = self.port {
            next.port = u16::try_from(port)
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| ProxyError::Validation("port must be in 1..=65535".into()))?;
        }
        if let Some(ref user) = self.user {
            next.user = user.clone();
        }
        if let Some(ref password) = self.password {
            next.password = password.clone();
        }
        if let Some(ref labels) = self.auth_methods {
            next.auth_methods = parse_auth_methods(labels)?;
        }
        if let Some(max) = self.max_connections {
            next.max_connections = usize::try_from(max)
                .ok()
                .filter(|m| *m > 0)
                .ok_or_else(|| {
                    ProxyError::Validation("maxConnections must be greater than 0".into())
                })?;
        }
        if let Some(ref entries) = self.black_list {
            next.blacklist = Blacklist::parse(entries).map_err(ProxyError::Validation)?;
        }

        next.validate()?;
        Ok(next)
    }
}

/// Config as served by the API; never carries the password
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigView {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth_methods: Vec<String>,
    pub max_connections: usize,
    pub black_list: Vec<String>,
}

impl From<&ServerConfig> for ConfigView {
    fn from(config: &ServerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            user: config.user.clone(),
            auth_methods: config
                .auth_methods
                .iter()
                .map(|m| m.label().to_string())
                .collect(),
            max_connections: config.max_connections,
            black_list: config.blacklist.to_strings(),
        }
    }
}

/// Management API listener settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminConfig {
    pub host: String,
    pub port: u16,
    pub token: Option<String>,
}

/// Fully resolved startup configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub admin: AdminConfig,
    pub log_mode: String,
    pub log_capacity: usize,
    pub conn: ConnConfig,
    pub block_private_targets: bool,
}

impl AppConfig {
    /// Merge the config file (if any) with CLI overrides and validate
    pub fn load(cli: &CliArgs) -> Result<Self> {
        let file = match cli.config_file {
            Some(ref path) => FileConfig::load(path)
                .with_context(|| format!("failed to load config file {}", path.display()))?,
            None => FileConfig::default(),
        };
        Self::from_parts(cli, file)
    }

    fn from_parts(cli: &CliArgs, file: FileConfig) -> Result<Self> {
        let mut server = ServerConfig::from_section(&file.socks5)?;
        if let Some(ref host) = cli.host {
            server.host = host.clone();
        }
        if let Some(port) = cli.port {
            server.port = port;
        }
        server.validate()?;

        let admin = AdminConfig {
            host: cli
                .admin_host
                .clone()
                .or(file.admin.host)
                .unwrap_or_else(|| DEFAULT_ADMIN_HOST.to_string()),
            port: cli
                .admin_port
                .or(file.admin.port)
                .unwrap_or(DEFAULT_ADMIN_PORT),
            token: cli
                .admin_token
                .clone()
                .or(file.admin.token)
                .filter(|t| !t.is_empty()),
        };

        let log_mode = cli
            .log_mode
            .clone()
            .or(file.log.level)
            .unwrap_or_else(|| "info".to_string());

        Ok(Self {
            server,
            admin,
            log_mode,
            log_capacity: cli.log_capacity,
            conn: ConnConfig::from_cli(cli),
            block_private_targets: cli.block_private_targets,
        })
    }
}
