//! Core proxy server module
//!
//! This module contains the core proxy functionality:
//! - Protocol parsing (SOCKS5)
//! - Session tracking
//! - Bidirectional relay
//! - Hook traits for extensibility

pub mod hooks;
pub mod ip_filter;
pub mod protocol;
mod relay;
mod server;
pub mod session;

pub use hooks::{AuthDecision, AuthMethod, DenyReason};
pub use protocol::{Address, DecodeResult};
pub use relay::{relay_bidirectional, RelayEnd, RelayOutcome};
pub use server::{Server, ServerBuilder};
pub use session::{Session, SessionHandle, SessionId, SessionState, SessionTable};
