//! Wire protocol between clients and the room coordinator.
//!
//! Every WebSocket binary frame carries exactly one bincode-encoded message.
//! A session opens with a [`Handshake`]; after that the client sends
//! [`ClientEvent`]s and the server answers with [`ServerEvent`]s.

use crate::fog::CellKey;
use crate::model::{
    ConfigPatch, NewProp, NewToken, Position, Prop, PropId, PropPatch, Role, Room, RoomConfig,
    RoomId, SceneContent, Token, TokenId, TokenPatch, UserId,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(bincode::Error),

    #[error("failed to decode message: {0}")]
    Decode(bincode::Error),

    #[error("invalid fog cell key {0:?}")]
    InvalidCellKey(String),
}

/// First frame of every session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub auth_token: String,
}

/// Client → server requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientEvent {
    MoveTokenRequest {
        token_id: TokenId,
        position: Position,
    },
    RevealFog {
        cells: Vec<CellKey>,
        erase: bool,
    },
    ResetFog,
    AddToken {
        token: NewToken,
    },
    RemoveToken {
        token_id: TokenId,
    },
    UpdateToken {
        token_id: TokenId,
        changes: TokenPatch,
    },
    UpdateMap {
        changes: ConfigPatch,
    },
    AddProp {
        prop: NewProp,
    },
    RemoveProp {
        prop_id: PropId,
    },
    UpdateProp {
        prop_id: PropId,
        changes: PropPatch,
    },
    /// Replaces config, fog and tokens in one coordinator step.
    LoadScene {
        content: SceneContent,
    },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::MoveTokenRequest { .. } => "MOVE_TOKEN_REQUEST",
            ClientEvent::RevealFog { .. } => "REVEAL_FOG",
            ClientEvent::ResetFog => "RESET_FOG",
            ClientEvent::AddToken { .. } => "ADD_TOKEN",
            ClientEvent::RemoveToken { .. } => "REMOVE_TOKEN",
            ClientEvent::UpdateToken { .. } => "UPDATE_TOKEN",
            ClientEvent::UpdateMap { .. } => "UPDATE_MAP",
            ClientEvent::AddProp { .. } => "ADD_PROP",
            ClientEvent::RemoveProp { .. } => "REMOVE_PROP",
            ClientEvent::UpdateProp { .. } => "UPDATE_PROP",
            ClientEvent::LoadScene { .. } => "LOAD_SCENE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Unauthorized,
    NotFound,
    Malformed,
    AuthFailed,
    /// The room's stored record could not be read; retry later.
    Unavailable,
}

/// Server → client broadcasts and replies. Every entity-bearing variant
/// carries the absolute post-mutation value, never a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerEvent {
    StateSync {
        room: Room,
        role: Role,
        user_id: UserId,
    },
    TokenMoved {
        token_id: TokenId,
        position: Position,
    },
    TokenAdded {
        token: Token,
    },
    TokenRemoved {
        token_id: TokenId,
    },
    TokenUpdated {
        token: Token,
    },
    FogUpdated {
        revealed_cells: Vec<CellKey>,
    },
    MapUpdated {
        config: RoomConfig,
    },
    PropAdded {
        prop: Prop,
    },
    PropRemoved {
        prop_id: PropId,
    },
    PropUpdated {
        prop: Prop,
    },
    SceneLoaded {
        room: Room,
    },
    UserJoined {
        user_id: UserId,
    },
    UserLeft {
        user_id: UserId,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl ServerEvent {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code,
            message: message.into(),
        }
    }
}

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serialize(message).map_err(ProtocolError::Encode)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    bincode::deserialize(bytes).map_err(ProtocolError::Decode)
}
