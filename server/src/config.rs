//! Server runtime configuration.

use crate::auth::{AcceptAll, Authenticator, StaticTokens};
use shared::{UserId, DEFAULT_IDLE_GRACE};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to
    pub bind_addr: String,
    /// How long an empty room stays loaded before it is saved and evicted
    pub idle_grace: Duration,
    /// Per-session outbound queue length; a session that fills it is dropped
    pub outbound_capacity: usize,
    /// Time allowed between the WebSocket upgrade and the handshake frame
    pub handshake_timeout: Duration,
    /// user id -> secret. Empty means every handshake is accepted.
    pub auth_tokens: HashMap<UserId, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            idle_grace: DEFAULT_IDLE_GRACE,
            outbound_capacity: 256,
            handshake_timeout: Duration::from_secs(10),
            auth_tokens: HashMap::new(),
        }
    }
}

impl ServerConfig {
    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    pub fn with_idle_grace(mut self, grace: Duration) -> Self {
        self.idle_grace = grace;
        self
    }

    pub fn with_token(mut self, user_id: impl Into<UserId>, secret: impl Into<String>) -> Self {
        self.auth_tokens.insert(user_id.into(), secret.into());
        self
    }

    /// Builds the authenticator implied by `auth_tokens`.
    pub fn authenticator(&self) -> Arc<dyn Authenticator> {
        if self.auth_tokens.is_empty() {
            Arc::new(AcceptAll)
        } else {
            Arc::new(StaticTokens::new(self.auth_tokens.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Handshake;

    fn handshake(user: &str, token: &str) -> Handshake {
        Handshake {
            room_id: "r".to_string(),
            user_id: user.to_string(),
            auth_token: token.to_string(),
        }
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.outbound_capacity, 256);
        assert_eq!(config.idle_grace, DEFAULT_IDLE_GRACE);
        assert!(config.auth_tokens.is_empty());
    }

    #[test]
    fn test_empty_token_table_accepts_everyone() {
        let auth = ServerConfig::default().authenticator();
        assert!(auth.authenticate(&handshake("anyone", "")));
    }

    #[test]
    fn test_token_table_is_enforced() {
        let auth = ServerConfig::default()
            .with_token("alice", "s3cret")
            .authenticator();
        assert!(auth.authenticate(&handshake("alice", "s3cret")));
        assert!(!auth.authenticate(&handshake("alice", "guess")));
        assert!(!auth.authenticate(&handshake("bob", "s3cret")));
    }
}
