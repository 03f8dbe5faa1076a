//! Config-backed authentication

use std::net::IpAddr;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::config::ServerConfig;
use crate::core::hooks::{AuthDecision, AuthMethod, Authenticator, DenyReason};
use crate::core::protocol::PasswordAuthRequest;

/// Authenticator bound to one immutable config snapshot
pub struct ConfigAuthenticator {
    config: Arc<ServerConfig>,
}

impl ConfigAuthenticator {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }
}

impl Authenticator for ConfigAuthenticator {
    fn check_client(&self, ip: &IpAddr) -> AuthDecision {
        if self.config.blacklist.contains(ip) {
            AuthDecision::Denied(DenyReason::Blacklisted)
        } else {
            AuthDecision::Authorized
        }
    }

    fn select_method(&self, offered: &[u8]) -> Option<AuthMethod> {
        self.config
            .auth_methods
            .iter()
            .copied()
            .find(|method| offered.contains(&method.code()))
    }

    fn authenticate(
        &self,
        ip: &IpAddr,
        method: AuthMethod,
        credentials: Option<&PasswordAuthRequest>,
    ) -> AuthDecision {
        // Blacklist wins regardless of credentials
        if let AuthDecision::Denied(reason) = self.check_client(ip) {
            return AuthDecision::Denied(reason);
        }
        if !self.config.auth_methods.contains(&method) {
            return AuthDecision::Denied(DenyReason::NoAcceptableMethod);
        }
        match method {
            AuthMethod::NoAuth => AuthDecision::Authorized,
            AuthMethod::UserPass => match credentials {
                // Both fields are always compared
                Some(creds)
                    if bool::from(
                        creds.username.as_bytes().ct_eq(self.config.user.as_bytes())
                            & creds.password.as_bytes().ct_eq(self.config.password.as_bytes()),
                    ) =>
                {
                    AuthDecision::Authorized
                }
                _ => AuthDecision::Denied(DenyReason::BadCredentials),
            },
        }
    }
}
