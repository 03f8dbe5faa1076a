//! Live SOCKS5 configuration
//!
//! Readers clone an `Arc` snapshot; updates validate a candidate and swap it
//! in under the write lock, so a rejected update never becomes visible.

use std::sync::{Arc, RwLock};

use super::auth::ConfigAuthenticator;
use crate::config::{ConfigUpdate, ServerConfig};
use crate::core::hooks::{Authenticator, PolicySource};
use crate::error::ProxyError;
use crate::logger::log;

pub struct ConfigStore {
    current: RwLock<Arc<ServerConfig>>,
}

impl ConfigStore {
    pub fn new(initial: ServerConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    /// Current snapshot
    pub fn current(&self) -> Arc<ServerConfig> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Validate and apply a partial update
    pub fn update(&self, update: &ConfigUpdate) -> Result<Arc<ServerConfig>, ProxyError> {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        let next = Arc::new(update.apply(&guard)?);
        if next.host != guard.host || next.port != guard.port {
            log::info!(
                host = %next.host,
                port = next.port,
                "Listen address changed, takes effect on restart"
            );
        }
        *guard = Arc::clone(&next);
        Ok(next)
    }
}

impl PolicySource for ConfigStore {
    fn snapshot(&self) -> Arc<dyn Authenticator> {
        Arc::new(ConfigAuthenticator::new(self.current()))
    }

    fn max_connections(&self) -> usize {
        self.current().max_connections
    }
}
