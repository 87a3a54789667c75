//! # Tabletop Client Library
//!
//! Client half of the tabletop sync layer: one connection per room, an
//! optimistic local copy of the room, the fog brush, and scene switching.
//! Rendering is left to the embedding application; everything here is
//! headless.
//!
//! ## Architecture Overview
//!
//! ### Optimistic Updates
//! Drags and brush strokes change the local room immediately and are sent to
//! the room coordinator in the background. The client never waits for
//! confirmation and never rolls back on its own; it simply accepts whatever
//! absolute value the coordinator broadcasts for an entity, its own echo
//! included.
//!
//! ### Resynchronization
//! When the connection drops the manager reconnects with exponential
//! backoff. Events issued while offline are dropped. The `STATE_SYNC` sent on
//! every successful join replaces the local room wholesale.
//!
//! ## Module Organization
//!
//! - [`connection`]: WebSocket lifecycle, handshake, observers, backoff
//! - [`reconciler`]: local room copy, drag throttling, event application
//! - [`fog`]: brush stamping for the moderator
//! - [`scene`]: save and switch scene snapshots
//! - [`error`]: the crate's error type
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::connection::ConnectionManager;
//! use client::reconciler::Reconciler;
//! use shared::Position;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let connection = Arc::new(ConnectionManager::new("ws://127.0.0.1:8080"));
//!     let reconciler = Reconciler::new(Arc::clone(&connection));
//!     let _feed = reconciler.follow();
//!
//!     connection.connect("crypt", "alice", "secret");
//!
//!     // Later, per pointer sample while dragging:
//!     reconciler.drag_token("token-id", Position::new(120.0, 80.0));
//!     // And when the pointer is released:
//!     reconciler.release_token("token-id", Position::new(124.0, 76.0));
//! }
//! ```

pub mod connection;
pub mod error;
pub mod fog;
pub mod reconciler;
pub mod scene;

pub use connection::{Backoff, ConnectionManager, ConnectionState, EventSink, Subscription};
pub use error::ClientError;
pub use fog::{BrushMode, FogPainter};
pub use reconciler::Reconciler;
pub use scene::{SceneSwitcher, SwitchMode, SCENE_LOAD_TIMEOUT};
