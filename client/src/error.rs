use shared::{ProtocolError, Rejection, StoreError};
use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("not permitted: {0}")]
    Rejected(#[from] Rejection),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("connection closed")]
    Closed,

    #[error("not connected")]
    NotConnected,

    #[error("no room state received yet")]
    NoRoomState,

    #[error("no current scene")]
    NoCurrentScene,

    #[error("a scene switch is already in progress")]
    SwitchInProgress,

    #[error("room did not show scene {0} in time")]
    SceneNotLoaded(String),
}
