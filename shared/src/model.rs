//! Shared entity schema for a tabletop room.
//!
//! Both sides hold the same types: the server keeps the authoritative
//! [`Room`], clients keep an optimistic copy of it. Partial updates travel
//! as patch structs whose `None` fields mean "leave unchanged".

use crate::fog::FogState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub type RoomId = String;
pub type UserId = String;
pub type TokenId = String;
pub type PropId = String;
pub type SceneId = String;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Rounds both coordinates to the nearest multiple of `grid_size`.
    pub fn snapped(self, grid_size: u32) -> Self {
        if grid_size == 0 {
            return self;
        }
        let grid = grid_size as f64;
        Self {
            x: (self.x / grid).round() * grid,
            y: (self.y / grid).round() * grid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomConfig {
    pub map_image: Option<String>,
    /// Edge length of one grid cell in map units. Never zero.
    pub grid_size: u32,
    pub snap_to_grid: bool,
    pub fog_enabled: bool,
    pub map_width: u32,
    pub map_height: u32,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            map_image: None,
            grid_size: 50,
            snap_to_grid: true,
            fog_enabled: false,
            map_width: 1000,
            map_height: 1000,
        }
    }
}

/// Partial map configuration; only `Some` fields are written.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfigPatch {
    pub map_image: Option<Option<String>>,
    pub grid_size: Option<u32>,
    pub snap_to_grid: Option<bool>,
    pub fog_enabled: Option<bool>,
    pub map_width: Option<u32>,
    pub map_height: Option<u32>,
}

impl ConfigPatch {
    /// A patch that overwrites every field with `config`.
    pub fn replace_with(config: &RoomConfig) -> Self {
        Self {
            map_image: Some(config.map_image.clone()),
            grid_size: Some(config.grid_size),
            snap_to_grid: Some(config.snap_to_grid),
            fog_enabled: Some(config.fog_enabled),
            map_width: Some(config.map_width),
            map_height: Some(config.map_height),
        }
    }
}

impl RoomConfig {
    pub fn merge(&mut self, patch: &ConfigPatch) {
        if let Some(map_image) = &patch.map_image {
            self.map_image = map_image.clone();
        }
        if let Some(grid_size) = patch.grid_size {
            self.grid_size = grid_size;
        }
        if let Some(snap) = patch.snap_to_grid {
            self.snap_to_grid = snap;
        }
        if let Some(fog) = patch.fog_enabled {
            self.fog_enabled = fog;
        }
        if let Some(width) = patch.map_width {
            self.map_width = width;
        }
        if let Some(height) = patch.map_height {
            self.map_height = height;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenId,
    pub owner_user_id: UserId,
    pub character_id: Option<String>,
    pub label: String,
    pub image: Option<String>,
    pub image_offset: Position,
    pub position: Position,
    /// Footprint in grid cells along one edge.
    pub size: u32,
    pub rotation: f32,
    pub visible: bool,
    pub color: String,
    pub hp: Option<i32>,
    pub max_hp: Option<i32>,
}

/// A token as submitted by a client, before the server assigns its id.
///
/// `owner_user_id` is only honoured when the requester is the moderator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewToken {
    pub owner_user_id: Option<UserId>,
    pub character_id: Option<String>,
    pub label: String,
    pub image: Option<String>,
    pub image_offset: Position,
    pub position: Position,
    pub size: u32,
    pub rotation: f32,
    pub visible: bool,
    pub color: String,
    pub hp: Option<i32>,
    pub max_hp: Option<i32>,
}

impl NewToken {
    /// Default-looking token at `position`, owned by whoever submits it.
    pub fn new(label: impl Into<String>, position: Position) -> Self {
        Self {
            owner_user_id: None,
            character_id: None,
            label: label.into(),
            image: None,
            image_offset: Position::default(),
            position,
            size: 1,
            rotation: 0.0,
            visible: true,
            color: "#c0392b".to_string(),
            hp: None,
            max_hp: None,
        }
    }

    /// Completes the token once the server has picked its id and owner.
    /// A zero size is raised to one cell.
    pub fn into_token(self, id: TokenId, owner_user_id: UserId) -> Token {
        Token {
            id,
            owner_user_id,
            character_id: self.character_id,
            label: self.label,
            image: self.image,
            image_offset: self.image_offset,
            position: self.position,
            size: self.size.max(1),
            rotation: self.rotation,
            visible: self.visible,
            color: self.color,
            hp: self.hp,
            max_hp: self.max_hp,
        }
    }
}

impl From<&Token> for NewToken {
    /// Strips the id but keeps the owner, so a moderator re-adding a stored
    /// token preserves who controls it.
    fn from(token: &Token) -> Self {
        Self {
            owner_user_id: Some(token.owner_user_id.clone()),
            character_id: token.character_id.clone(),
            label: token.label.clone(),
            image: token.image.clone(),
            image_offset: token.image_offset,
            position: token.position,
            size: token.size,
            rotation: token.rotation,
            visible: token.visible,
            color: token.color.clone(),
            hp: token.hp,
            max_hp: token.max_hp,
        }
    }
}

/// Partial token update. `visible` and `owner_user_id` are moderator-only.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TokenPatch {
    pub owner_user_id: Option<UserId>,
    pub character_id: Option<Option<String>>,
    pub label: Option<String>,
    pub image: Option<Option<String>>,
    pub image_offset: Option<Position>,
    pub position: Option<Position>,
    pub size: Option<u32>,
    pub rotation: Option<f32>,
    pub visible: Option<bool>,
    pub color: Option<String>,
    pub hp: Option<Option<i32>>,
    pub max_hp: Option<Option<i32>>,
}

impl TokenPatch {
    pub fn touches_moderator_fields(&self) -> bool {
        self.visible.is_some() || self.owner_user_id.is_some()
    }
}

impl Token {
    pub fn merge(&mut self, patch: &TokenPatch) {
        if let Some(owner) = &patch.owner_user_id {
            self.owner_user_id = owner.clone();
        }
        if let Some(character_id) = &patch.character_id {
            self.character_id = character_id.clone();
        }
        if let Some(label) = &patch.label {
            self.label = label.clone();
        }
        if let Some(image) = &patch.image {
            self.image = image.clone();
        }
        if let Some(offset) = patch.image_offset {
            self.image_offset = offset;
        }
        if let Some(position) = patch.position {
            self.position = position;
        }
        if let Some(size) = patch.size {
            self.size = size.max(1);
        }
        if let Some(rotation) = patch.rotation {
            self.rotation = rotation;
        }
        if let Some(visible) = patch.visible {
            self.visible = visible;
        }
        if let Some(color) = &patch.color {
            self.color = color.clone();
        }
        if let Some(hp) = patch.hp {
            self.hp = hp;
        }
        if let Some(max_hp) = patch.max_hp {
            self.max_hp = max_hp;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prop {
    pub id: PropId,
    pub label: String,
    pub image: Option<String>,
    pub position: Position,
    pub width: f64,
    pub height: f64,
    pub opacity: f32,
    pub locked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProp {
    pub label: String,
    pub image: Option<String>,
    pub position: Position,
    pub width: f64,
    pub height: f64,
    pub opacity: f32,
    pub locked: bool,
}

impl NewProp {
    /// Completes the prop with a server-assigned id, clamping opacity.
    pub fn into_prop(self, id: PropId) -> Prop {
        Prop {
            id,
            label: self.label,
            image: self.image,
            position: self.position,
            width: self.width,
            height: self.height,
            opacity: self.opacity.clamp(0.0, 1.0),
            locked: self.locked,
        }
    }
}

/// Partial prop update; only `Some` fields are written.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PropPatch {
    pub label: Option<String>,
    pub image: Option<Option<String>>,
    pub position: Option<Position>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub opacity: Option<f32>,
    pub locked: Option<bool>,
}

impl Prop {
    /// Shallow overwrite of the fields present in `patch`.
    pub fn merge(&mut self, patch: &PropPatch) {
        if let Some(label) = &patch.label {
            self.label = label.clone();
        }
        if let Some(image) = &patch.image {
            self.image = image.clone();
        }
        if let Some(position) = patch.position {
            self.position = position;
        }
        if let Some(width) = patch.width {
            self.width = width;
        }
        if let Some(height) = patch.height {
            self.height = height;
        }
        if let Some(opacity) = patch.opacity {
            self.opacity = opacity.clamp(0.0, 1.0);
        }
        if let Some(locked) = patch.locked {
            self.locked = locked;
        }
    }
}

/// Live, in-memory session state for one tabletop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub moderator_user_id: UserId,
    pub config: RoomConfig,
    pub tokens: Vec<Token>,
    pub props: Vec<Prop>,
    pub fog_state: FogState,
    pub connected_user_ids: BTreeSet<UserId>,
}

impl Room {
    /// Empty room named after its id, with default map settings.
    pub fn new(id: impl Into<RoomId>, moderator_user_id: impl Into<UserId>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            moderator_user_id: moderator_user_id.into(),
            config: RoomConfig::default(),
            tokens: Vec::new(),
            props: Vec::new(),
            fog_state: FogState::default(),
            connected_user_ids: BTreeSet::new(),
        }
    }

    /// Token lookup by id. Rooms hold few enough tokens that a scan wins
    /// over keeping an index in sync.
    pub fn token(&self, token_id: &str) -> Option<&Token> {
        self.tokens.iter().find(|t| t.id == token_id)
    }

    /// Mutable token lookup by id.
    pub fn token_mut(&mut self, token_id: &str) -> Option<&mut Token> {
        self.tokens.iter_mut().find(|t| t.id == token_id)
    }

    /// Removes a token, keeping the order of the rest. Returns the removed
    /// token, or `None` when no token has that id.
    pub fn remove_token(&mut self, token_id: &str) -> Option<Token> {
        let index = self.tokens.iter().position(|t| t.id == token_id)?;
        Some(self.tokens.remove(index))
    }

    /// Inserts or replaces the token with the same id. Replacement keeps the
    /// token's position in the list so broadcasts never reorder tokens.
    pub fn upsert_token(&mut self, token: Token) {
        match self.token_mut(&token.id) {
            Some(existing) => *existing = token,
            None => self.tokens.push(token),
        }
    }

    /// Mutable prop lookup by id.
    pub fn prop_mut(&mut self, prop_id: &str) -> Option<&mut Prop> {
        self.props.iter_mut().find(|p| p.id == prop_id)
    }

    /// Removes a prop, keeping the order of the rest.
    pub fn remove_prop(&mut self, prop_id: &str) -> Option<Prop> {
        let index = self.props.iter().position(|p| p.id == prop_id)?;
        Some(self.props.remove(index))
    }

    /// Inserts or replaces the prop with the same id, in place.
    pub fn upsert_prop(&mut self, prop: Prop) {
        match self.prop_mut(&prop.id) {
            Some(existing) => *existing = prop,
            None => self.props.push(prop),
        }
    }

    /// Ids of every token, ordered. Two rooms with equal sets agree on which
    /// tokens exist regardless of list order.
    pub fn token_ids(&self) -> BTreeSet<TokenId> {
        self.tokens.iter().map(|t| t.id.clone()).collect()
    }

    /// Copy of what a scene stores: config, fog and tokens. Props and the
    /// connected user list stay with the room.
    pub fn content(&self) -> SceneContent {
        SceneContent {
            config: self.config.clone(),
            fog_state: self.fog_state.clone(),
            tokens: self.tokens.clone(),
        }
    }
}

/// The part of a room a scene captures.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SceneContent {
    pub config: RoomConfig,
    pub fog_state: FogState,
    pub tokens: Vec<Token>,
}

impl SceneContent {
    /// Whether `room` currently shows this content. Loading a scene gives
    /// tokens fresh ids, so tokens are compared by label and owner only.
    pub fn is_shown_by(&self, room: &Room) -> bool {
        fn faces(tokens: &[Token]) -> Vec<(&str, &str)> {
            let mut faces: Vec<(&str, &str)> = tokens
                .iter()
                .map(|t| (t.label.as_str(), t.owner_user_id.as_str()))
                .collect();
            faces.sort_unstable();
            faces
        }

        room.config == self.config
            && room.fog_state == self.fog_state
            && faces(&room.tokens) == faces(&self.tokens)
    }
}

/// A named, persisted snapshot loadable into a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub id: SceneId,
    pub room_id: RoomId,
    pub name: String,
    pub order_index: u32,
    pub content: SceneContent,
}

impl Scene {
    /// Empty scene; its content is filled in when a room is saved into it.
    pub fn new(
        id: impl Into<SceneId>,
        room_id: impl Into<RoomId>,
        name: impl Into<String>,
        order_index: u32,
    ) -> Self {
        Self {
            id: id.into(),
            room_id: room_id.into(),
            name: name.into(),
            order_index,
            content: SceneContent::default(),
        }
    }
}

/// Caller's authority inside one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Moderator,
    Player { owned_token_ids: BTreeSet<TokenId> },
}

impl Role {
    /// Moderator iff `user_id` is the room's moderator; otherwise a player
    /// owning whichever tokens name them as owner.
    pub fn resolve(room: &Room, user_id: &str) -> Self {
        if room.moderator_user_id == user_id {
            return Role::Moderator;
        }
        let owned_token_ids = room
            .tokens
            .iter()
            .filter(|t| t.owner_user_id == user_id)
            .map(|t| t.id.clone())
            .collect();
        Role::Player { owned_token_ids }
    }

    pub fn is_moderator(&self) -> bool {
        matches!(self, Role::Moderator)
    }

    pub fn controls(&self, token_id: &str) -> bool {
        match self {
            Role::Moderator => true,
            Role::Player { owned_token_ids } => owned_token_ids.contains(token_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn token(id: &str, owner: &str) -> Token {
        NewToken::new(id, Position::new(0.0, 0.0)).into_token(id.to_string(), owner.to_string())
    }

    #[test]
    fn test_position_snapping() {
        let snapped = Position::new(74.0, 26.0).snapped(50);
        assert_approx_eq!(snapped.x, 50.0);
        assert_approx_eq!(snapped.y, 50.0);

        let untouched = Position::new(13.0, 7.0).snapped(0);
        assert_approx_eq!(untouched.x, 13.0);
        assert_approx_eq!(untouched.y, 7.0);
    }

    #[test]
    fn test_config_merge_only_touches_provided_fields() {
        let mut config = RoomConfig::default();
        let patch = ConfigPatch {
            grid_size: Some(70),
            map_image: Some(Some("maps/cave.png".to_string())),
            ..ConfigPatch::default()
        };
        config.merge(&patch);

        assert_eq!(config.grid_size, 70);
        assert_eq!(config.map_image.as_deref(), Some("maps/cave.png"));
        assert_eq!(config.map_width, RoomConfig::default().map_width);
        assert!(config.snap_to_grid);
    }

    #[test]
    fn test_config_replace_patch_roundtrips_every_field() {
        let target = RoomConfig {
            map_image: None,
            grid_size: 32,
            snap_to_grid: false,
            fog_enabled: true,
            map_width: 640,
            map_height: 480,
        };
        let mut config = RoomConfig {
            map_image: Some("old.png".to_string()),
            ..RoomConfig::default()
        };
        config.merge(&ConfigPatch::replace_with(&target));
        assert_eq!(config, target);
    }

    #[test]
    fn test_token_merge_can_clear_optional_fields() {
        let mut t = token("t1", "alice");
        t.hp = Some(12);
        let patch = TokenPatch {
            hp: Some(None),
            label: Some("Goblin".to_string()),
            ..TokenPatch::default()
        };
        t.merge(&patch);

        assert_eq!(t.hp, None);
        assert_eq!(t.label, "Goblin");
        assert_eq!(t.owner_user_id, "alice");
    }

    #[test]
    fn test_prop_opacity_clamped() {
        let prop = NewProp {
            label: "crate".to_string(),
            image: None,
            position: Position::default(),
            width: 10.0,
            height: 10.0,
            opacity: 3.0,
            locked: false,
        }
        .into_prop("p1".to_string());
        assert_eq!(prop.opacity, 1.0);

        let mut prop = prop;
        prop.merge(&PropPatch {
            opacity: Some(-0.5),
            ..PropPatch::default()
        });
        assert_eq!(prop.opacity, 0.0);
    }

    #[test]
    fn test_role_resolution() {
        let mut room = Room::new("r1", "gm");
        room.tokens.push(token("a", "alice"));
        room.tokens.push(token("b", "bob"));

        assert_eq!(Role::resolve(&room, "gm"), Role::Moderator);

        let alice = Role::resolve(&room, "alice");
        assert!(!alice.is_moderator());
        assert!(alice.controls("a"));
        assert!(!alice.controls("b"));
    }

    #[test]
    fn test_upsert_and_remove_token() {
        let mut room = Room::new("r1", "gm");
        room.upsert_token(token("a", "alice"));
        let mut moved = token("a", "alice");
        moved.position = Position::new(5.0, 5.0);
        room.upsert_token(moved);

        assert_eq!(room.tokens.len(), 1);
        assert_approx_eq!(room.token("a").map(|t| t.position.x).unwrap_or_default(), 5.0);
        assert!(room.remove_token("a").is_some());
        assert!(room.remove_token("a").is_none());
    }

    #[test]
    fn test_scene_content_shown_regardless_of_token_ids() {
        let mut room = Room::new("crypt", "gm");
        room.tokens = vec![token("t1", "alice"), token("t2", "gm")];
        let mut content = room.content();
        assert!(content.is_shown_by(&room));

        // Same faces under fresh ids and a different order.
        content.tokens = vec![
            NewToken::new("t2", Position::new(5.0, 5.0)).into_token("x".into(), "gm".into()),
            NewToken::new("t1", Position::new(0.0, 0.0)).into_token("y".into(), "alice".into()),
        ];
        assert!(content.is_shown_by(&room));

        content.config.grid_size = 40;
        assert!(!content.is_shown_by(&room));
    }

    #[test]
    fn test_new_token_from_stored_token_keeps_owner() {
        let stored = token("t9", "bob");
        let request = NewToken::from(&stored);
        assert_eq!(request.owner_user_id.as_deref(), Some("bob"));
        assert_eq!(request.label, "t9");
    }
}
