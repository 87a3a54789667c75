//! # Tabletop Room Server
//!
//! Authoritative side of the tabletop sync layer. Every room has exactly one
//! coordinator task that validates, applies and broadcasts mutations, so all
//! members of a room observe the same events in the same order.
//!
//! ## Core Responsibilities
//!
//! ### Authority
//! Clients mutate their local copy optimistically, but nothing they send is
//! trusted. Each request passes through `shared::authorize` against the
//! coordinator's copy of the room before it is applied. Rejected moves are
//! dropped silently; every other rejection is answered with an `ERROR` to the
//! requesting session only.
//!
//! ### Absolute Broadcasts
//! Accepted requests are broadcast to the whole room, the requester
//! included, carrying the final value of whatever changed. Clients never have
//! to apply deltas in order to converge.
//!
//! ### Room Lifecycle
//! A room is loaded from the [`shared::RoomStore`] when its first session
//! joins, stays resident while anyone is connected, and is saved and evicted
//! after an idle grace period with no sessions.
//!
//! ## Module Organization
//!
//! - [`room`]: pure room state and request application, no I/O
//! - [`client_manager`]: sessions in a room and their bounded outbound queues
//! - [`coordinator`]: the per-room task and its lifecycle
//! - [`registry`]: room id to running coordinator, spawn and eviction
//! - [`auth`]: handshake validation
//! - [`network`]: WebSocket listener and per-session relay
//! - [`config`]: runtime settings
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//! use shared::MemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let config = ServerConfig::default().with_bind_addr("127.0.0.1:8080");
//!     let server = Server::new(config, Arc::new(MemoryStore::new())).await?;
//!     server.run().await
//! }
//! ```

pub mod auth;
pub mod client_manager;
pub mod config;
pub mod coordinator;
pub mod network;
pub mod registry;
pub mod room;
