//! Session roster for a single room.
//!
//! A session is one WebSocket connection. The same user may hold several
//! sessions (two browser tabs); the room only reports them as having left
//! once their last session is gone.
//!
//! Delivery never blocks the room task. Each session owns a bounded outbound
//! queue, and a session whose queue is full is dropped instead of having
//! events skipped, so every remaining session observes the same total order.

use log::{info, warn};
use shared::{ServerEvent, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;

pub type SessionId = u64;

/// Outbound half handed to the room by the connection task.
pub type Outbound = mpsc::Sender<Arc<ServerEvent>>;

#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub user_id: UserId,
    pub joined_at: Instant,
    outbound: Outbound,
}

impl Session {
    pub fn new(id: SessionId, user_id: UserId, outbound: Outbound) -> Self {
        Self {
            id,
            user_id,
            joined_at: Instant::now(),
            outbound,
        }
    }

    /// Queues an event without waiting. False when the session is gone or
    /// cannot keep up.
    fn deliver(&self, event: &Arc<ServerEvent>) -> bool {
        match self.outbound.try_send(Arc::clone(event)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Session {} ({}) outbound queue full, dropping it",
                    self.id, self.user_id
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct ClientManager {
    sessions: HashMap<SessionId, Session>,
}

impl ClientManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session. A reused id replaces the older entry.
    pub fn add_session(&mut self, id: SessionId, user_id: UserId, outbound: Outbound) {
        info!("Session {} joined as {}", id, user_id);
        self.sessions
            .insert(id, Session::new(id, user_id, outbound));
    }

    pub fn remove_session(&mut self, id: SessionId) -> Option<Session> {
        let session = self.sessions.remove(&id)?;
        info!("Session {} ({}) left", id, session.user_id);
        Some(session)
    }

    pub fn user_of(&self, id: SessionId) -> Option<&UserId> {
        self.sessions.get(&id).map(|s| &s.user_id)
    }

    /// True while any session of `user_id` remains.
    pub fn has_user(&self, user_id: &str) -> bool {
        self.sessions.values().any(|s| s.user_id == user_id)
    }

    /// Sends to a single session. Returns false when delivery failed.
    pub fn send_to(&self, id: SessionId, event: ServerEvent) -> bool {
        match self.sessions.get(&id) {
            Some(session) => session.deliver(&Arc::new(event)),
            None => false,
        }
    }

    /// Fans an event out to every session except `exclude`.
    ///
    /// Returns the sessions that could not take it. They are not removed
    /// here; the caller decides how their departure is announced.
    pub fn broadcast(&self, event: ServerEvent, exclude: Option<SessionId>) -> Vec<SessionId> {
        let event = Arc::new(event);
        let mut failed: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| Some(s.id) != exclude)
            .filter(|s| !s.deliver(&event))
            .map(|s| s.id)
            .collect();
        failed.sort_unstable();
        failed
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(user: &str) -> ServerEvent {
        ServerEvent::UserJoined {
            user_id: user.to_string(),
        }
    }

    #[test]
    fn test_add_and_remove_session() {
        let mut manager = ClientManager::new();
        let (tx, _rx) = mpsc::channel(4);

        manager.add_session(1, "alice".to_string(), tx);
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.user_of(1), Some(&"alice".to_string()));

        let removed = manager.remove_session(1);
        assert_eq!(removed.map(|s| s.user_id), Some("alice".to_string()));
        assert!(manager.is_empty());
        assert!(manager.remove_session(1).is_none());
    }

    #[test]
    fn test_user_with_two_sessions() {
        let mut manager = ClientManager::new();
        let (tx1, _rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);

        manager.add_session(1, "alice".to_string(), tx1);
        manager.add_session(2, "alice".to_string(), tx2);

        manager.remove_session(1);
        assert!(manager.has_user("alice"));
        manager.remove_session(2);
        assert!(!manager.has_user("alice"));
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let mut manager = ClientManager::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        manager.add_session(1, "alice".to_string(), tx1);
        manager.add_session(2, "bob".to_string(), tx2);

        let failed = manager.broadcast(joined("bob"), Some(2));
        assert!(failed.is_empty());

        assert_eq!(*rx1.recv().await.unwrap(), joined("bob"));
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_full_queue_reports_session() {
        let mut manager = ClientManager::new();
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(8);
        manager.add_session(1, "slow".to_string(), slow_tx);
        manager.add_session(2, "fast".to_string(), fast_tx);

        assert!(manager.broadcast(joined("x"), None).is_empty());
        assert_eq!(manager.broadcast(joined("y"), None), vec![1]);

        assert_eq!(*fast_rx.try_recv().unwrap(), joined("x"));
        assert_eq!(*fast_rx.try_recv().unwrap(), joined("y"));
    }

    #[test]
    fn test_closed_session_reports_failure() {
        let mut manager = ClientManager::new();
        let (tx, rx) = mpsc::channel(4);
        manager.add_session(7, "gone".to_string(), tx);
        drop(rx);

        assert!(!manager.send_to(7, joined("a")));
        assert_eq!(manager.broadcast(joined("a"), None), vec![7]);
        assert!(!manager.send_to(99, joined("a")));
    }
}
