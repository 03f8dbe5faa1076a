//! Business layer
//!
//! Concrete implementations of the core hooks backed by the live
//! configuration, plus the aggregated views served by the management API.

mod aggregator;
mod auth;
mod config_store;
mod stats;

pub use aggregator::{Aggregator, ServerStats, ServerStatus};
pub use auth::ConfigAuthenticator;
pub use config_store::ConfigStore;
pub use stats::{CounterSnapshot, ServerStatsCollector};
