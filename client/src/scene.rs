//! Scene switching.
//!
//! A scene is a saved `{config, fog, tokens}` snapshot. Switching persists
//! the live room into the scene being left, fetches the target, and pushes
//! the target's content into the live room through the coordinator.
//!
//! Two delivery modes exist. [`SwitchMode::Atomic`] sends one `LOAD_SCENE`
//! that the coordinator applies in a single step. [`SwitchMode::Scripted`]
//! replays the change as ordinary requests (remove every token, update the
//! map, reset and reveal fog, add every token). Scripted switches are not
//! transactional: an interruption leaves the room partly switched and the
//! switch can simply be run again.
//!
//! A switch stays in flight until the local room shows the target content.
//! If that never happens within the load timeout the switcher forgets its
//! current scene, so a later switch cannot save a half-loaded room over a
//! scene it does not hold.

use crate::connection::EventSink;
use crate::error::ClientError;
use crate::reconciler::Reconciler;
use log::{info, warn};
use parking_lot::Mutex;
use shared::{
    ClientEvent, ConfigPatch, NewToken, Room, Scene, SceneContent, SceneId, SceneStore,
    StoreError,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};

/// How long a switch waits for the room to show the target scene.
pub const SCENE_LOAD_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SwitchMode {
    #[default]
    Atomic,
    Scripted,
}

/// Clears the in-flight flag however the switch ends.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, ClientError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ClientError::SwitchInProgress)?;
        Ok(Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SceneSwitcher<S: EventSink, St: SceneStore> {
    reconciler: Reconciler<S>,
    store: Arc<St>,
    mode: SwitchMode,
    load_timeout: Duration,
    in_flight: AtomicBool,
    current: Mutex<Option<SceneId>>,
}

impl<S: EventSink, St: SceneStore> SceneSwitcher<S, St> {
    pub fn new(reconciler: Reconciler<S>, store: Arc<St>) -> Self {
        Self::with_mode(reconciler, store, SwitchMode::default())
    }

    pub fn with_mode(reconciler: Reconciler<S>, store: Arc<St>, mode: SwitchMode) -> Self {
        Self {
            reconciler,
            store,
            mode,
            load_timeout: SCENE_LOAD_TIMEOUT,
            in_flight: AtomicBool::new(false),
            current: Mutex::new(None),
        }
    }

    pub fn with_load_timeout(mut self, load_timeout: Duration) -> Self {
        self.load_timeout = load_timeout;
        self
    }

    pub fn mode(&self) -> SwitchMode {
        self.mode
    }

    pub fn is_switching(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Scene the live room was last loaded from or saved into.
    pub fn current(&self) -> Option<SceneId> {
        self.current.lock().clone()
    }

    pub fn set_current(&self, scene_id: Option<SceneId>) {
        *self.current.lock() = scene_id;
    }

    /// Persists the live room into the current scene without switching.
    /// Refused while a switch is in flight.
    pub async fn save_current(&self) -> Result<Scene, ClientError> {
        let _guard = InFlight::acquire(&self.in_flight)?;
        let scene_id = self.current().ok_or(ClientError::NoCurrentScene)?;
        let room = self.live_room()?;
        self.persist(&scene_id, &room).await
    }

    /// Leaves the current scene (saving it), loads `target_id` and waits
    /// until the local room shows it.
    pub async fn switch_to(&self, target_id: &str) -> Result<(), ClientError> {
        let _guard = InFlight::acquire(&self.in_flight)?;

        let room = self.live_room()?;
        if let Some(current) = self.current() {
            self.persist(&current, &room).await?;
        }
        let target = self.store.load_scene(target_id).await?;
        let content = target.content;

        info!(
            "Switching room {} to scene {} ({:?})",
            room.id, target_id, self.mode
        );
        let mut changes = self.reconciler.subscribe();
        match self.mode {
            SwitchMode::Atomic => self.send(ClientEvent::LoadScene {
                content: content.clone(),
            })?,
            SwitchMode::Scripted => {
                if let Err(e) = self.replay(&room, &content) {
                    self.set_current(None);
                    return Err(e);
                }
            }
        }

        if self.shown(&content, &mut changes).await {
            self.set_current(Some(target_id.to_string()));
            Ok(())
        } else {
            warn!(
                "Room {} did not show scene {} within {:?}",
                room.id, target_id, self.load_timeout
            );
            self.set_current(None);
            Err(ClientError::SceneNotLoaded(target_id.to_string()))
        }
    }

    async fn shown(&self, content: &SceneContent, changes: &mut watch::Receiver<u64>) -> bool {
        let deadline = Instant::now() + self.load_timeout;
        loop {
            if let Some(room) = self.reconciler.snapshot() {
                if content.is_shown_by(&room) {
                    return true;
                }
            }
            match timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => return false,
            }
        }
    }

    fn replay(&self, live: &Room, target: &SceneContent) -> Result<(), ClientError> {
        for token in &live.tokens {
            self.send(ClientEvent::RemoveToken {
                token_id: token.id.clone(),
            })?;
        }
        self.send(ClientEvent::UpdateMap {
            changes: ConfigPatch::replace_with(&target.config),
        })?;
        self.send(ClientEvent::ResetFog)?;
        self.send(ClientEvent::RevealFog {
            cells: target.fog_state.cells(),
            erase: false,
        })?;
        for token in &target.tokens {
            self.send(ClientEvent::AddToken {
                token: NewToken::from(token),
            })?;
        }
        Ok(())
    }

    fn live_room(&self) -> Result<Room, ClientError> {
        let room = self.reconciler.snapshot().ok_or(ClientError::NoRoomState)?;
        match self.reconciler.role() {
            Some(role) if role.is_moderator() => Ok(room),
            _ => Err(ClientError::Rejected(shared::Rejection::ModeratorOnly(
                "scene switching",
            ))),
        }
    }

    async fn persist(&self, scene_id: &str, room: &Room) -> Result<Scene, ClientError> {
        let mut scene = match self.store.load_scene(scene_id).await {
            Ok(scene) => scene,
            Err(StoreError::SceneNotFound(_)) => {
                let order = self.store.list_scenes(&room.id).await?.len() as u32;
                Scene::new(scene_id, room.id.as_str(), scene_id, order)
            }
            Err(e) => return Err(e.into()),
        };
        scene.content = room.content();
        self.store.save_scene(&scene).await?;
        info!("Saved room {} into scene {}", room.id, scene_id);
        Ok(scene)
    }

    fn send(&self, event: ClientEvent) -> Result<(), ClientError> {
        let name = event.name();
        self.reconciler.submit(event).map_err(|e| {
            warn!("Scene switch interrupted at {}: {}", name, e);
            e
        })
    }
}
