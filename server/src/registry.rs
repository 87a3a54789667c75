//! Room id -> running coordinator.
//!
//! Coordinators are spawned on the first join and remove themselves when
//! they evict. All sends and the eviction check happen under the same lock,
//! so a join can never land on a coordinator that has already decided to
//! exit.

use crate::coordinator::{RoomCommand, RoomCoordinator};
use log::{debug, info, warn};
use parking_lot::Mutex;
use shared::{Room, RoomId, RoomStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

type RoomTable = Arc<Mutex<HashMap<RoomId, RoomHandle>>>;

struct RoomHandle {
    generation: u64,
    commands: mpsc::UnboundedSender<RoomCommand>,
}

pub struct RoomRegistry {
    rooms: RoomTable,
    store: Arc<dyn RoomStore>,
    idle_grace: Duration,
    next_generation: AtomicU64,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn RoomStore>, idle_grace: Duration) -> Self {
        Self {
            rooms: Arc::new(Mutex::new(HashMap::new())),
            store,
            idle_grace,
            next_generation: AtomicU64::new(1),
        }
    }

    /// Routes a command to the room's coordinator.
    ///
    /// A `Join` starts the coordinator when none is running, or replaces one
    /// whose task has died. Anything else addressed to a room that is not
    /// running is dropped.
    pub fn dispatch(&self, room_id: &str, command: RoomCommand) {
        let mut rooms = self.rooms.lock();

        let command = match rooms.get(room_id) {
            Some(handle) => match handle.commands.send(command) {
                Ok(()) => return,
                Err(mpsc::error::SendError(command)) => {
                    warn!("Coordinator for room {} is gone", room_id);
                    rooms.remove(room_id);
                    command
                }
            },
            None => command,
        };

        if !matches!(command, RoomCommand::Join { .. }) {
            debug!("Room {} not running, dropping {:?}", room_id, command);
            return;
        }

        let handle = self.spawn(room_id);
        if handle.commands.send(command).is_err() {
            warn!("Coordinator for room {} exited before its first join", room_id);
            return;
        }
        rooms.insert(room_id.to_string(), handle);
    }

    /// Committed state of a running room.
    pub async fn snapshot(&self, room_id: &str) -> Option<Room> {
        let (reply, response) = oneshot::channel();
        self.dispatch(room_id, RoomCommand::Snapshot { reply });
        response.await.ok()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    pub fn is_running(&self, room_id: &str) -> bool {
        self.rooms.lock().contains_key(room_id)
    }

    fn spawn(&self, room_id: &str) -> RoomHandle {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (commands, receiver) = mpsc::unbounded_channel();
        let slot = RegistrySlot {
            rooms: Arc::clone(&self.rooms),
            room_id: room_id.to_string(),
            generation,
        };
        let coordinator = RoomCoordinator::new(
            room_id.to_string(),
            Arc::clone(&self.store),
            self.idle_grace,
            receiver,
            slot,
        );
        tokio::spawn(coordinator.run());
        info!("Started coordinator for room {}", room_id);

        RoomHandle {
            generation,
            commands,
        }
    }
}

/// A coordinator's own entry in the registry.
pub(crate) struct RegistrySlot {
    rooms: RoomTable,
    room_id: RoomId,
    generation: u64,
}

impl RegistrySlot {
    #[cfg(test)]
    pub(crate) fn detached(room_id: &str) -> Self {
        Self {
            rooms: Arc::new(Mutex::new(HashMap::new())),
            room_id: room_id.to_string(),
            generation: 0,
        }
    }

    /// Gives up the slot once the grace period ends.
    ///
    /// Returns a command that raced in before the lock was taken; the
    /// coordinator must keep running to handle it. Otherwise the entry is
    /// removed and `None` is returned.
    pub(crate) fn release(
        &self,
        commands: &mut mpsc::UnboundedReceiver<RoomCommand>,
    ) -> Option<RoomCommand> {
        let mut rooms = self.rooms.lock();
        if let Ok(command) = commands.try_recv() {
            return Some(command);
        }
        let ours = rooms
            .get(&self.room_id)
            .map_or(false, |handle| handle.generation == self.generation);
        if ours {
            rooms.remove(&self.room_id);
        }
        None
    }
}
