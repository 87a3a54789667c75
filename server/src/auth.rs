//! Handshake validation.
//!
//! The real deployment delegates identity to an external provider. The
//! coordinator only needs a yes/no answer for `(user_id, auth_token)` before
//! a session is admitted to a room.

use log::warn;
use shared::{Handshake, UserId};
use std::collections::HashMap;

pub trait Authenticator: Send + Sync + 'static {
    fn authenticate(&self, handshake: &Handshake) -> bool;
}

/// Admits every handshake. Used for local play and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl Authenticator for AcceptAll {
    fn authenticate(&self, _handshake: &Handshake) -> bool {
        true
    }
}

/// Fixed table of per-user secrets.
#[derive(Debug, Clone)]
pub struct StaticTokens {
    tokens: HashMap<UserId, String>,
}

impl StaticTokens {
    pub fn new(tokens: HashMap<UserId, String>) -> Self {
        Self { tokens }
    }
}

impl Authenticator for StaticTokens {
    fn authenticate(&self, handshake: &Handshake) -> bool {
        match self.tokens.get(&handshake.user_id) {
            Some(secret) if *secret == handshake.auth_token => true,
            Some(_) => {
                warn!("Wrong auth token for user {}", handshake.user_id);
                false
            }
            None => {
                warn!("Unknown user {}", handshake.user_id);
                false
            }
        }
    }
}
