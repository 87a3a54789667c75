//! Optimistic local copy of the room.
//!
//! User actions mutate the local room synchronously and are sent to the
//! coordinator in the background. Nothing is ever rolled back: a local value
//! is only replaced when a broadcast for the same entity arrives, the
//! sender's own echo included. `STATE_SYNC` and `SCENE_LOADED` replace the
//! whole room.
//!
//! Token drags are throttled per token with a trailing edge: the first
//! sample opens a window, later samples only update the pending position,
//! and whatever is pending when the window closes is sent. Superseded
//! positions are never sent.

use crate::connection::{ConnectionManager, EventSink, Subscription};
use crate::error::ClientError;
use log::{debug, warn};
use parking_lot::Mutex;
use shared::{
    authorize, CellKey, ClientEvent, ErrorCode, Position, Role, Room, RoomConfig, ServerEvent,
    TokenId, UserId, MOVE_THROTTLE,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

struct PendingMove {
    position: Position,
    flush: JoinHandle<()>,
}

#[derive(Default)]
struct LocalState {
    room: Option<Room>,
    role: Option<Role>,
    user_id: Option<UserId>,
    last_error: Option<(ErrorCode, String)>,
    pending_moves: HashMap<TokenId, PendingMove>,
}

impl LocalState {
    fn permits(&self, event: &ClientEvent) -> Result<(), ClientError> {
        let (Some(room), Some(user_id)) = (&self.room, &self.user_id) else {
            return Err(ClientError::NoRoomState);
        };
        authorize(room, user_id, event)?;
        Ok(())
    }

    fn refresh_role(&mut self) {
        if let (Some(room), Some(user_id)) = (&self.room, &self.user_id) {
            self.role = Some(Role::resolve(room, user_id));
        }
    }

    fn cancel_pending_moves(&mut self) {
        for (_, pending) in self.pending_moves.drain() {
            pending.flush.abort();
        }
    }
}

pub struct Reconciler<S: EventSink> {
    sink: Arc<S>,
    local: Arc<Mutex<LocalState>>,
    throttle: Duration,
    revision: Arc<watch::Sender<u64>>,
}

impl<S: EventSink> Clone for Reconciler<S> {
    fn clone(&self) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            local: Arc::clone(&self.local),
            throttle: self.throttle,
            revision: Arc::clone(&self.revision),
        }
    }
}

impl<S: EventSink> Reconciler<S> {
    pub fn new(sink: Arc<S>) -> Self {
        Self::with_throttle(sink, MOVE_THROTTLE)
    }

    pub fn with_throttle(sink: Arc<S>, throttle: Duration) -> Self {
        Self {
            sink,
            local: Arc::new(Mutex::new(LocalState::default())),
            throttle,
            revision: Arc::new(watch::channel(0).0),
        }
    }

    pub fn snapshot(&self) -> Option<Room> {
        self.local.lock().room.clone()
    }

    pub fn role(&self) -> Option<Role> {
        self.local.lock().role.clone()
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.local.lock().user_id.clone()
    }

    pub fn config(&self) -> Option<RoomConfig> {
        self.local.lock().room.as_ref().map(|room| room.config.clone())
    }

    /// Most recent `ERROR` reported by the server, if any.
    pub fn last_error(&self) -> Option<(ErrorCode, String)> {
        self.local.lock().last_error.clone()
    }

    /// One drag sample. Returns false when the local role may not move the
    /// token, in which case nothing changes.
    pub fn drag_token(&self, token_id: &str, position: Position) -> bool {
        let mut local = self.local.lock();
        let event = ClientEvent::MoveTokenRequest {
            token_id: token_id.to_string(),
            position,
        };
        if local.permits(&event).is_err() {
            return false;
        }
        if let Some(token) = local.room.as_mut().and_then(|room| room.token_mut(token_id)) {
            token.position = position;
        }

        if let Some(pending) = local.pending_moves.get_mut(token_id) {
            pending.position = position;
            return true;
        }

        let flush = self.schedule_flush(token_id.to_string());
        local
            .pending_moves
            .insert(token_id.to_string(), PendingMove { position, flush });
        true
    }

    /// Ends a drag: snaps when the map asks for it, drops any pending
    /// throttled send and sends the final position now.
    pub fn release_token(&self, token_id: &str, position: Position) -> bool {
        let event = {
            let mut local = self.local.lock();
            let position = match &local.room {
                Some(room) if room.config.snap_to_grid => position.snapped(room.config.grid_size),
                _ => position,
            };
            let event = ClientEvent::MoveTokenRequest {
                token_id: token_id.to_string(),
                position,
            };
            if local.permits(&event).is_err() {
                return false;
            }
            if let Some(pending) = local.pending_moves.remove(token_id) {
                pending.flush.abort();
            }
            if let Some(token) = local.room.as_mut().and_then(|room| room.token_mut(token_id)) {
                token.position = position;
            }
            event
        };
        self.sink.send(event)
    }

    /// One brush stamp: local fog changes now, the stamp is sent as its own
    /// `REVEAL_FOG`.
    pub fn paint_fog(&self, cells: Vec<CellKey>, erase: bool) -> bool {
        if cells.is_empty() {
            return false;
        }
        let event = ClientEvent::RevealFog { cells, erase };
        {
            let mut local = self.local.lock();
            if local.permits(&event).is_err() {
                return false;
            }
            if let (Some(room), ClientEvent::RevealFog { cells, erase }) = (local.room.as_mut(), &event) {
                room.fog_state.apply(cells, *erase);
            }
        }
        self.sink.send(event)
    }

    /// Sends a request that has no optimistic local effect, after the same
    /// role check the server will make.
    pub fn submit(&self, event: ClientEvent) -> Result<(), ClientError> {
        self.local.lock().permits(&event)?;
        if self.sink.send(event) {
            Ok(())
        } else {
            Err(ClientError::NotConnected)
        }
    }

    /// Ticks once for every server event applied, after the local room has
    /// been updated.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Applies one server event to the local room.
    pub fn handle(&self, event: &ServerEvent) {
        self.apply(event);
        self.revision.send_modify(|revision| *revision += 1);
    }

    fn apply(&self, event: &ServerEvent) {
        let mut local = self.local.lock();

        match event {
            ServerEvent::StateSync {
                room,
                role,
                user_id,
            } => {
                debug!("State sync: {} tokens", room.tokens.len());
                local.cancel_pending_moves();
                local.room = Some(room.clone());
                local.role = Some(role.clone());
                local.user_id = Some(user_id.clone());
                return;
            }
            ServerEvent::SceneLoaded { room } => {
                local.cancel_pending_moves();
                local.room = Some(room.clone());
                local.refresh_role();
                return;
            }
            ServerEvent::Error { code, message } => {
                warn!("Server rejected a request ({:?}): {}", code, message);
                local.last_error = Some((*code, message.clone()));
                return;
            }
            _ => {}
        }

        let Some(room) = local.room.as_mut() else {
            debug!("Ignoring event before state sync");
            return;
        };

        match event {
            ServerEvent::TokenMoved { token_id, position } => {
                if let Some(token) = room.token_mut(token_id) {
                    token.position = *position;
                }
            }
            ServerEvent::TokenAdded { token } | ServerEvent::TokenUpdated { token } => {
                room.upsert_token(token.clone());
            }
            ServerEvent::TokenRemoved { token_id } => {
                room.remove_token(token_id);
            }
            ServerEvent::FogUpdated { revealed_cells } => {
                room.fog_state = revealed_cells.iter().copied().collect();
            }
            ServerEvent::MapUpdated { config } => {
                room.config = config.clone();
            }
            ServerEvent::PropAdded { prop } | ServerEvent::PropUpdated { prop } => {
                room.upsert_prop(prop.clone());
            }
            ServerEvent::PropRemoved { prop_id } => {
                room.remove_prop(prop_id);
            }
            ServerEvent::UserJoined { user_id } => {
                room.connected_user_ids.insert(user_id.clone());
            }
            ServerEvent::UserLeft { user_id } => {
                room.connected_user_ids.remove(user_id);
            }
            ServerEvent::StateSync { .. } | ServerEvent::SceneLoaded { .. } | ServerEvent::Error { .. } => {}
        }

        if matches!(
            event,
            ServerEvent::TokenAdded { .. } | ServerEvent::TokenUpdated { .. } | ServerEvent::TokenRemoved { .. }
        ) {
            local.refresh_role();
        }
    }

    fn schedule_flush(&self, token_id: TokenId) -> JoinHandle<()> {
        let sink = Arc::clone(&self.sink);
        let local = Arc::clone(&self.local);
        let throttle = self.throttle;

        tokio::spawn(async move {
            sleep(throttle).await;
            let position = local
                .lock()
                .pending_moves
                .remove(&token_id)
                .map(|pending| pending.position);
            if let Some(position) = position {
                if !sink.send(ClientEvent::MoveTokenRequest {
                    token_id: token_id.clone(),
                    position,
                }) {
                    debug!("Dropped throttled move of {}: not connected", token_id);
                }
            }
        })
    }
}

impl Reconciler<ConnectionManager> {
    /// Feeds every event from `connection` into this reconciler.
    pub fn follow(&self) -> Subscription {
        let reconciler = self.clone();
        self.sink.on_message(move |event| reconciler.handle(event))
    }
}
