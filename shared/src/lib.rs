//! # Tabletop Shared Library
//!
//! Types and rules shared by the room coordinator (server) and the
//! connection/reconciliation layer (client).
//!
//! - [`model`]: rooms, tokens, props, scenes and their partial-update patches
//! - [`fog`]: fog cell addressing, brush geometry and the revealed-cell set
//! - [`protocol`]: handshake, client and server event enums, bincode codec
//! - [`authority`]: the single authorization function for room mutations
//! - [`store`]: persistence traits and an in-memory implementation

pub mod authority;
pub mod fog;
pub mod model;
pub mod protocol;
pub mod store;

use std::time::Duration;

pub use authority::{authorize, Rejection};
pub use fog::{brush_cells, CellKey, FogState, MAX_BRUSH_RADIUS};
pub use model::{
    ConfigPatch, NewProp, NewToken, Position, Prop, PropId, PropPatch, Role, Room, RoomConfig,
    RoomId, Scene, SceneContent, SceneId, Token, TokenId, TokenPatch, UserId,
};
pub use protocol::{ClientEvent, ErrorCode, Handshake, ProtocolError, ServerEvent};
pub use store::{MemoryStore, RoomStore, SceneStore, StoreError};

/// Minimum spacing between outbound moves of one dragged token.
pub const MOVE_THROTTLE: Duration = Duration::from_millis(50);
/// First reconnect delay after an unexpected close.
pub const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
/// Ceiling for the doubling reconnect delay.
pub const RECONNECT_MAX: Duration = Duration::from_secs(16);
/// How long an empty room stays in memory before eviction.
pub const DEFAULT_IDLE_GRACE: Duration = Duration::from_secs(60);
