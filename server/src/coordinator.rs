//! Per-room serializing task.
//!
//! Every mutation of one room flows through a single [`RoomCoordinator`]
//! reading an unbounded command channel, so requests are applied and
//! broadcast in one total order without locks around the room state.
//! Rooms are independent tasks and run in parallel.
//!
//! Lifecycle: `Empty -> Active -> Idle -> Evicted`, with `Idle -> Active`
//! when a session joins before the grace period ends. On eviction the room
//! is written back to the [`RoomStore`] and the task exits.
//!
//! A room whose record could not be read is never created afresh or saved:
//! joins are refused with `UNAVAILABLE` and each one retries the load.

use crate::client_manager::{ClientManager, Outbound, SessionId};
use crate::registry::RegistrySlot;
use crate::room::RoomState;
use log::{debug, error, info, warn};
use shared::{ClientEvent, ErrorCode, Room, RoomId, RoomStore, ServerEvent, UserId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

#[derive(Debug)]
pub enum RoomCommand {
    /// An authenticated session enters the room.
    Join {
        session_id: SessionId,
        user_id: UserId,
        outbound: Outbound,
    },
    Leave {
        session_id: SessionId,
    },
    /// A decoded request from a session already in the room.
    Request {
        session_id: SessionId,
        event: ClientEvent,
    },
    /// Reads the committed room state.
    Snapshot {
        reply: oneshot::Sender<Room>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Empty,
    Active,
    Idle,
    Evicted,
}

enum Wake {
    Command(Option<RoomCommand>),
    GraceElapsed,
}

pub struct RoomCoordinator {
    room_id: RoomId,
    state: Option<RoomState>,
    /// Set once the store has answered, with or without a record.
    loaded: bool,
    clients: ClientManager,
    lifecycle: Lifecycle,
    idle_grace: Duration,
    idle_deadline: Option<Instant>,
    store: Arc<dyn RoomStore>,
    commands: mpsc::UnboundedReceiver<RoomCommand>,
    slot: RegistrySlot,
}

impl RoomCoordinator {
    pub(crate) fn new(
        room_id: RoomId,
        store: Arc<dyn RoomStore>,
        idle_grace: Duration,
        commands: mpsc::UnboundedReceiver<RoomCommand>,
        slot: RegistrySlot,
    ) -> Self {
        Self {
            room_id,
            state: None,
            loaded: false,
            clients: ClientManager::new(),
            lifecycle: Lifecycle::Empty,
            idle_grace,
            idle_deadline: None,
            store,
            commands,
            slot,
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Loads the stored room, then serves commands until eviction.
    pub async fn run(mut self) {
        self.load().await;

        loop {
            let deadline = self.idle_deadline;
            let wake = tokio::select! {
                command = self.commands.recv() => Wake::Command(command),
                _ = wait_for(deadline) => Wake::GraceElapsed,
            };

            let command = match wake {
                Wake::Command(command) => command,
                Wake::GraceElapsed => {
                    self.persist().await;
                    match self.slot.release(&mut self.commands) {
                        Some(command) => Some(command),
                        None => {
                            self.lifecycle = Lifecycle::Evicted;
                            info!("Room {} evicted", self.room_id);
                            return;
                        }
                    }
                }
            };

            match command {
                Some(command) => self.handle(command).await,
                None => {
                    self.persist().await;
                    info!("Room {} shut down", self.room_id);
                    return;
                }
            }
        }
    }

    async fn load(&mut self) {
        match self.store.load_room(&self.room_id).await {
            Ok(Some(room)) => {
                info!(
                    "Loaded room {} ({} tokens)",
                    self.room_id,
                    room.tokens.len()
                );
                self.state = Some(RoomState::restore(room));
                self.loaded = true;
            }
            Ok(None) => {
                debug!("Room {} has no stored record", self.room_id);
                self.loaded = true;
            }
            Err(e) => error!("Failed to load room {}: {}", self.room_id, e),
        }
    }

    async fn persist(&self) {
        let Some(state) = &self.state else { return };
        let mut room = state.room().clone();
        room.connected_user_ids.clear();
        match self.store.save_room(&room).await {
            Ok(()) => debug!("Saved room {}", self.room_id),
            Err(e) => error!("Failed to save room {}: {}", self.room_id, e),
        }
    }

    pub(crate) async fn handle(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Join {
                session_id,
                user_id,
                outbound,
            } => self.join(session_id, user_id, outbound).await,
            RoomCommand::Leave { session_id } => self.drop_sessions(vec![session_id]),
            RoomCommand::Request { session_id, event } => self.request(session_id, event),
            RoomCommand::Snapshot { reply } => {
                if let Some(state) = &self.state {
                    let _ = reply.send(state.room().clone());
                }
            }
        }
    }

    async fn join(&mut self, session_id: SessionId, user_id: UserId, outbound: Outbound) {
        if !self.loaded {
            self.load().await;
        }
        if !self.loaded {
            warn!(
                "Room {}: refusing {} while the store is unavailable",
                self.room_id, user_id
            );
            let reply = ServerEvent::error(ErrorCode::Unavailable, "room could not be loaded");
            let _ = outbound.try_send(Arc::new(reply));
            if self.clients.is_empty() && self.idle_deadline.is_none() {
                self.idle_deadline = Some(Instant::now() + self.idle_grace);
            }
            return;
        }

        if self.state.is_none() {
            // No record anywhere: whoever opens the room moderates it.
            let state = RoomState::create(&self.room_id, &user_id);
            if let Err(e) = self.store.save_room(state.room()).await {
                error!("Failed to save new room {}: {}", self.room_id, e);
            }
            self.state = Some(state);
        }
        let Some(state) = self.state.as_mut() else {
            return;
        };

        self.clients
            .add_session(session_id, user_id.clone(), outbound);
        let newly_present = state.join(&user_id);
        let sync = state.state_sync(&user_id);

        if self.lifecycle != Lifecycle::Active {
            info!("Room {} active", self.room_id);
        }
        self.lifecycle = Lifecycle::Active;
        self.idle_deadline = None;

        if !self.clients.send_to(session_id, sync) {
            self.drop_sessions(vec![session_id]);
            return;
        }
        if newly_present {
            self.broadcast(ServerEvent::UserJoined { user_id }, Some(session_id));
        }
    }

    fn request(&mut self, session_id: SessionId, event: ClientEvent) {
        let Some(user_id) = self.clients.user_of(session_id).cloned() else {
            debug!("Room {}: request from unknown session {}", self.room_id, session_id);
            return;
        };
        let Some(state) = self.state.as_mut() else {
            return;
        };

        let is_move = matches!(event, ClientEvent::MoveTokenRequest { .. });
        let name = event.name();

        match state.apply(&user_id, event) {
            Ok(broadcast) => self.broadcast(broadcast, None),
            Err(rejection) if is_move => {
                debug!("Room {}: dropped move from {}: {}", self.room_id, user_id, rejection);
            }
            Err(rejection) => {
                warn!(
                    "Room {}: rejected {} from {}: {}",
                    self.room_id, name, user_id, rejection
                );
                let reply = ServerEvent::error(rejection.code(), rejection.to_string());
                if !self.clients.send_to(session_id, reply) {
                    self.drop_sessions(vec![session_id]);
                }
            }
        }
    }

    fn broadcast(&mut self, event: ServerEvent, exclude: Option<SessionId>) {
        let failed = self.clients.broadcast(event, exclude);
        if !failed.is_empty() {
            self.drop_sessions(failed);
        }
    }

    /// Removes sessions and announces users whose last session went away.
    /// Announcements can fail on further sessions, which are drained too.
    fn drop_sessions(&mut self, mut pending: Vec<SessionId>) {
        while let Some(session_id) = pending.pop() {
            let Some(session) = self.clients.remove_session(session_id) else {
                continue;
            };
            if self.clients.has_user(&session.user_id) {
                continue;
            }
            let left = match self.state.as_mut() {
                Some(state) => state.leave(&session.user_id),
                None => false,
            };
            if left {
                let event = ServerEvent::UserLeft {
                    user_id: session.user_id,
                };
                pending.extend(self.clients.broadcast(event, None));
            }
        }

        if self.clients.is_empty() && self.lifecycle == Lifecycle::Active {
            self.lifecycle = Lifecycle::Idle;
            self.idle_deadline = Some(Instant::now() + self.idle_grace);
            info!(
                "Room {} idle, evicting in {:?} unless someone joins",
                self.room_id, self.idle_grace
            );
        }
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
