use log::{debug, info};
use shared::{authorize, ClientEvent, Rejection, Role, Room, ServerEvent, UserId};
use uuid::Uuid;

/// Authoritative state of one room, with no I/O.
///
/// Each accepted request produces exactly one broadcast carrying the final
/// value of whatever it touched.
#[derive(Debug, Clone)]
pub struct RoomState {
    room: Room,
}

impl RoomState {
    /// Starts a brand-new room whose moderator is `moderator_user_id`.
    pub fn create(room_id: &str, moderator_user_id: &str) -> Self {
        info!("Created room {} moderated by {}", room_id, moderator_user_id);
        Self {
            room: Room::new(room_id, moderator_user_id),
        }
    }

    /// Resumes a stored room. Connections never survive a restart, so the
    /// connected set starts empty.
    pub fn restore(mut room: Room) -> Self {
        room.connected_user_ids.clear();
        Self { room }
    }

    pub fn room(&self) -> &Room {
        &self.room
    }

    pub fn role_of(&self, user_id: &str) -> Role {
        Role::resolve(&self.room, user_id)
    }

    /// Marks `user_id` present. Returns true when they were not already.
    pub fn join(&mut self, user_id: &str) -> bool {
        self.room.connected_user_ids.insert(user_id.to_string())
    }

    /// Marks `user_id` absent. Returns true when they had been present.
    pub fn leave(&mut self, user_id: &str) -> bool {
        self.room.connected_user_ids.remove(user_id)
    }

    pub fn state_sync(&self, user_id: &UserId) -> ServerEvent {
        ServerEvent::StateSync {
            room: self.room.clone(),
            role: self.role_of(user_id),
            user_id: user_id.clone(),
        }
    }

    /// Authorizes and applies one request.
    pub fn apply(&mut self, user_id: &str, event: ClientEvent) -> Result<ServerEvent, Rejection> {
        let role = authorize(&self.room, user_id, &event)?;
        debug!("Room {}: {} from {}", self.room.id, event.name(), user_id);

        let broadcast = match event {
            ClientEvent::MoveTokenRequest { token_id, position } => {
                let token = self
                    .room
                    .token_mut(&token_id)
                    .ok_or_else(|| Rejection::UnknownToken(token_id.clone()))?;
                token.position = position;
                ServerEvent::TokenMoved { token_id, position }
            }

            ClientEvent::RevealFog { cells, erase } => {
                self.room.fog_state.apply(&cells, erase);
                ServerEvent::FogUpdated {
                    revealed_cells: self.room.fog_state.cells(),
                }
            }

            ClientEvent::ResetFog => {
                self.room.fog_state.reset();
                ServerEvent::FogUpdated {
                    revealed_cells: Vec::new(),
                }
            }

            ClientEvent::AddToken { mut token } => {
                let requested_owner = token.owner_user_id.take();
                let owner = match (role.is_moderator(), requested_owner) {
                    (true, Some(owner)) => owner,
                    _ => user_id.to_string(),
                };
                let token = token.into_token(Uuid::new_v4().to_string(), owner);
                self.room.tokens.push(token.clone());
                ServerEvent::TokenAdded { token }
            }

            ClientEvent::RemoveToken { token_id } => {
                self.room
                    .remove_token(&token_id)
                    .ok_or_else(|| Rejection::UnknownToken(token_id.clone()))?;
                ServerEvent::TokenRemoved { token_id }
            }

            ClientEvent::UpdateToken { token_id, changes } => {
                let token = self
                    .room
                    .token_mut(&token_id)
                    .ok_or_else(|| Rejection::UnknownToken(token_id.clone()))?;
                token.merge(&changes);
                ServerEvent::TokenUpdated {
                    token: token.clone(),
                }
            }

            ClientEvent::UpdateMap { changes } => {
                self.room.config.merge(&changes);
                ServerEvent::MapUpdated {
                    config: self.room.config.clone(),
                }
            }

            ClientEvent::AddProp { prop } => {
                let prop = prop.into_prop(Uuid::new_v4().to_string());
                self.room.props.push(prop.clone());
                ServerEvent::PropAdded { prop }
            }

            ClientEvent::RemoveProp { prop_id } => {
                self.room
                    .remove_prop(&prop_id)
                    .ok_or_else(|| Rejection::UnknownProp(prop_id.clone()))?;
                ServerEvent::PropRemoved { prop_id }
            }

            ClientEvent::UpdateProp { prop_id, changes } => {
                let prop = self
                    .room
                    .prop_mut(&prop_id)
                    .ok_or_else(|| Rejection::UnknownProp(prop_id.clone()))?;
                prop.merge(&changes);
                ServerEvent::PropUpdated { prop: prop.clone() }
            }

            ClientEvent::LoadScene { content } => {
                self.room.config = content.config;
                self.room.fog_state = content.fog_state;
                self.room.tokens = content
                    .tokens
                    .into_iter()
                    .map(|mut token| {
                        token.id = Uuid::new_v4().to_string();
                        token
                    })
                    .collect();
                info!(
                    "Room {}: scene loaded with {} tokens",
                    self.room.id,
                    self.room.tokens.len()
                );
                ServerEvent::SceneLoaded {
                    room: self.room.clone(),
                }
            }
        };

        Ok(broadcast)
    }
}
