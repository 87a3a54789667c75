//! Persistence boundary.
//!
//! The real application keeps rooms and scenes in an external database. The
//! coordinator and the scene switcher only see these traits; [`MemoryStore`]
//! backs the binaries and tests.

use crate::model::{Room, RoomId, Scene, SceneId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("scene {0} not found")]
    SceneNotFound(SceneId),

    #[error("storage backend failed: {0}")]
    Backend(String),
}

/// Room records, read when a coordinator starts and written when it evicts.
#[async_trait]
pub trait RoomStore: Send + Sync + 'static {
    async fn load_room(&self, room_id: &str) -> Result<Option<Room>, StoreError>;
    async fn save_room(&self, room: &Room) -> Result<(), StoreError>;
}

/// Scene snapshots, read and written by the scene switch sequence.
#[async_trait]
pub trait SceneStore: Send + Sync + 'static {
    async fn load_scene(&self, scene_id: &str) -> Result<Scene, StoreError>;
    async fn save_scene(&self, scene: &Scene) -> Result<(), StoreError>;
    async fn list_scenes(&self, room_id: &str) -> Result<Vec<Scene>, StoreError>;
}

#[derive(Default)]
struct Records {
    rooms: HashMap<RoomId, Room>,
    scenes: HashMap<SceneId, Scene>,
}

/// Process-local store. Cloning shares the same records.
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<Records>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn room_count(&self) -> usize {
        self.records.lock().rooms.len()
    }
}

#[async_trait]
impl RoomStore for MemoryStore {
    async fn load_room(&self, room_id: &str) -> Result<Option<Room>, StoreError> {
        Ok(self.records.lock().rooms.get(room_id).cloned())
    }

    async fn save_room(&self, room: &Room) -> Result<(), StoreError> {
        self.records
            .lock()
            .rooms
            .insert(room.id.clone(), room.clone());
        Ok(())
    }
}

#[async_trait]
impl SceneStore for MemoryStore {
    async fn load_scene(&self, scene_id: &str) -> Result<Scene, StoreError> {
        self.records
            .lock()
            .scenes
            .get(scene_id)
            .cloned()
            .ok_or_else(|| StoreError::SceneNotFound(scene_id.to_string()))
    }

    async fn save_scene(&self, scene: &Scene) -> Result<(), StoreError> {
        self.records
            .lock()
            .scenes
            .insert(scene.id.clone(), scene.clone());
        Ok(())
    }

    async fn list_scenes(&self, room_id: &str) -> Result<Vec<Scene>, StoreError> {
        let mut scenes: Vec<Scene> = self
            .records
            .lock()
            .scenes
            .values()
            .filter(|s| s.room_id == room_id)
            .cloned()
            .collect();
        scenes.sort_by_key(|s| s.order_index);
        Ok(scenes)
    }
}
