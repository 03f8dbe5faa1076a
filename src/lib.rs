//! SOCKS5 proxy server with an HTTP management API
//!
//! Architecture:
//! - `core/`: Protocol codec, session table, relay and hook traits
//! - `business/`: Config-backed auth, counters and dashboard views
//! - `handler`: Per-connection SOCKS5 state machine
//! - `server_runner`: Listener setup, admission and restart supervisor
//! - `api`: axum management API
//! - `app`: Process wiring shared by the binary and integration tests

pub mod api;
pub mod app;
pub mod business;
pub mod config;
pub mod core;
pub mod error;
pub mod handler;
pub mod logger;
pub mod server_runner;

pub use app::App;
pub use error::{ProxyError, Result};
