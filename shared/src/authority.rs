//! Authorization rules for room mutations.
//!
//! [`authorize`] is the single decision point. The coordinator consults it
//! before applying any request; clients consult the same function against
//! their local copy purely to avoid offering actions that would be refused.

use crate::model::{Role, Room};
use crate::protocol::{ClientEvent, ErrorCode};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("{0} is moderator-only")]
    ModeratorOnly(&'static str),

    #[error("token {0} is not yours")]
    NotOwner(String),

    #[error("unknown token {0}")]
    UnknownToken(String),

    #[error("unknown prop {0}")]
    UnknownProp(String),

    #[error("invalid request: {0}")]
    Invalid(String),
}

impl Rejection {
    pub fn code(&self) -> ErrorCode {
        match self {
            Rejection::ModeratorOnly(_) | Rejection::NotOwner(_) => ErrorCode::Unauthorized,
            Rejection::UnknownToken(_) | Rejection::UnknownProp(_) => ErrorCode::NotFound,
            Rejection::Invalid(_) => ErrorCode::Malformed,
        }
    }
}

/// Decides whether `user_id` may issue `event` against `room`.
///
/// Returns the caller's resolved role on success. Existence checks happen
/// here too so that a non-owner cannot probe which token ids exist.
pub fn authorize(room: &Room, user_id: &str, event: &ClientEvent) -> Result<Role, Rejection> {
    let role = Role::resolve(room, user_id);

    let require_moderator = |what: &'static str| {
        if role.is_moderator() {
            Ok(())
        } else {
            Err(Rejection::ModeratorOnly(what))
        }
    };

    let require_control = |token_id: &str| {
        if room.token(token_id).is_none() {
            return Err(Rejection::UnknownToken(token_id.to_string()));
        }
        if role.controls(token_id) {
            Ok(())
        } else {
            Err(Rejection::NotOwner(token_id.to_string()))
        }
    };

    match event {
        ClientEvent::MoveTokenRequest { token_id, .. } => require_control(token_id.as_str())?,
        ClientEvent::RemoveToken { token_id } => require_control(token_id.as_str())?,
        ClientEvent::UpdateToken { token_id, changes } => {
            require_control(token_id.as_str())?;
            if changes.visible.is_some() {
                require_moderator("token visibility")?;
            }
            if changes.owner_user_id.is_some() {
                require_moderator("token ownership")?;
            }
        }
        ClientEvent::AddToken { .. } => {}
        ClientEvent::RevealFog { .. } | ClientEvent::ResetFog => require_moderator("fog")?,
        ClientEvent::UpdateMap { changes } => {
            require_moderator("map configuration")?;
            if changes.grid_size == Some(0) {
                return Err(Rejection::Invalid("grid size must be positive".to_string()));
            }
        }
        ClientEvent::AddProp { .. } => require_moderator("props")?,
        ClientEvent::RemoveProp { prop_id } | ClientEvent::UpdateProp { prop_id, .. } => {
            require_moderator("props")?;
            if !room.props.iter().any(|p| &p.id == prop_id) {
                return Err(Rejection::UnknownProp(prop_id.clone()));
            }
        }
        ClientEvent::LoadScene { content } => {
            require_moderator("scene loading")?;
            if content.config.grid_size == 0 {
                return Err(Rejection::Invalid("grid size must be positive".to_string()));
            }
        }
    }

    Ok(role)
}
