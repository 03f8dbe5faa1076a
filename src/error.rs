use std::io;
use std::net::IpAddr;
use thiserror::Error;

/// Unified error type for the SOCKS5 server
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Malformed SOCKS5 frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// None of the client's offered methods is enabled on the server
    #[error("No acceptable authentication method")]
    NoAcceptableMethod,

    /// Credentials rejected
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Client address matched the blacklist
    #[error("Client {0} is blacklisted")]
    Blacklisted(IpAddr),

    /// Rejected configuration update
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown session id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Peer or target socket failure
    #[error("Transport error: {0}")]
    Transport(#[source] io::Error),

    /// A handshake phase or outbound dial took too long
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Configuration loading error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Whether this error counts as a rejected authentication attempt
    pub fn is_auth_rejection(&self) -> bool {
        matches!(
            self,
            ProxyError::AuthFailed(_) | ProxyError::Blacklisted(_) | ProxyError::NoAcceptableMethod
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ProxyError>;

impl From<toml::de::Error> for ProxyError {
    fn from(err: toml::de::Error) -> Self {
        ProxyError::Config(format!("TOML parse error: {}", err))
    }
}
