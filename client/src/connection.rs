//! Client side of the room connection.
//!
//! A [`ConnectionManager`] owns at most one WebSocket to the room server at
//! a time. It performs the handshake, fans inbound events out to observers
//! in arrival order, and reconnects with exponential backoff after an
//! unexpected close until [`ConnectionManager::disconnect`] is called.
//!
//! Sending is fire-and-forget. Events issued while there is no live
//! transport are dropped, never queued: the fresh `STATE_SYNC` that follows
//! a reconnect is the only recovery path.

use crate::error::ClientError;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use shared::protocol::{decode, encode};
use shared::{ClientEvent, ErrorCode, Handshake, ServerEvent, RECONNECT_INITIAL, RECONNECT_MAX};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32, delay: Duration },
}

/// Anything that can carry client events to the room.
pub trait EventSink: Send + Sync + 'static {
    /// Returns whether the event was handed to a live transport.
    fn send(&self, event: ClientEvent) -> bool;
}

/// Doubling reconnect delay with a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(RECONNECT_INITIAL, RECONNECT_MAX)
    }
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct ObserverList<T> {
    entries: Mutex<Vec<(u64, Callback<T>)>>,
}

impl<T> ObserverList<T> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, id: u64, callback: Callback<T>) {
        self.entries.lock().push((id, callback));
    }

    fn remove(&self, id: u64) {
        self.entries.lock().retain(|(entry, _)| *entry != id);
    }

    /// Observers run outside the lock so they may (un)subscribe.
    fn notify(&self, value: &T) {
        let current: Vec<Callback<T>> = self
            .entries
            .lock()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in current {
            callback(value);
        }
    }
}

/// Registration handle. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Live transport bookkeeping. `generation` changes on every connect and
/// disconnect so a superseded supervisor cannot touch the current link.
struct Link {
    generation: u64,
    state: ConnectionState,
    outbound: Option<mpsc::UnboundedSender<ClientEvent>>,
}

struct Shared {
    link: Mutex<Link>,
    backoff: Mutex<Backoff>,
    messages: ObserverList<ServerEvent>,
    state_changes: ObserverList<ConnectionState>,
    next_observer: AtomicU64,
}

impl Shared {
    fn begin(&self) -> u64 {
        let mut link = self.link.lock();
        link.generation += 1;
        link.outbound = None;
        link.generation
    }

    fn set_state(&self, generation: u64, state: ConnectionState) -> bool {
        {
            let mut link = self.link.lock();
            if link.generation != generation {
                return false;
            }
            if link.state == state {
                return true;
            }
            link.state = state;
        }
        debug!("Connection state: {:?}", state);
        self.state_changes.notify(&state);
        true
    }

    fn attach(&self, generation: u64, outbound: mpsc::UnboundedSender<ClientEvent>) -> bool {
        let mut link = self.link.lock();
        if link.generation != generation {
            return false;
        }
        link.outbound = Some(outbound);
        true
    }

    fn detach(&self, generation: u64) {
        let mut link = self.link.lock();
        if link.generation == generation {
            link.outbound = None;
        }
    }
}

pub struct ConnectionManager {
    url: String,
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// `server_url` is a `ws://host:port` address.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self::with_backoff(server_url, Backoff::default())
    }

    pub fn with_backoff(server_url: impl Into<String>, backoff: Backoff) -> Self {
        let shared = Shared {
            link: Mutex::new(Link {
                generation: 0,
                state: ConnectionState::Disconnected,
                outbound: None,
            }),
            backoff: Mutex::new(backoff),
            messages: ObserverList::new(),
            state_changes: ObserverList::new(),
            next_observer: AtomicU64::new(1),
        };
        Self {
            url: server_url.into(),
            shared: Arc::new(shared),
            supervisor: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.link.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Joins `room_id`, replacing any connection this manager already has.
    pub fn connect(&self, room_id: &str, user_id: &str, auth_token: &str) {
        let generation = self.shared.begin();
        let mut supervisor = self.supervisor.lock();
        if let Some(previous) = supervisor.take() {
            previous.abort();
        }

        let handshake = Handshake {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            auth_token: auth_token.to_string(),
        };
        info!("Connecting to {} room {} as {}", self.url, room_id, user_id);
        *supervisor = Some(tokio::spawn(supervise(
            Arc::clone(&self.shared),
            self.url.clone(),
            handshake,
            generation,
        )));
    }

    /// Closes the connection and stops reconnecting.
    pub fn disconnect(&self) {
        let generation = self.shared.begin();
        if let Some(task) = self.supervisor.lock().take() {
            task.abort();
        }
        self.shared
            .set_state(generation, ConnectionState::Disconnected);
    }

    pub fn send(&self, event: ClientEvent) -> bool {
        let link = self.shared.link.lock();
        match &link.outbound {
            Some(outbound) => outbound.send(event).is_ok(),
            None => {
                debug!("Not connected, dropping {}", event.name());
                false
            }
        }
    }

    /// Every inbound server event, in arrival order.
    pub fn on_message<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let id = self.shared.next_observer.fetch_add(1, Ordering::Relaxed);
        self.shared.messages.add(id, Arc::new(callback));
        let shared = Arc::downgrade(&self.shared);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(shared) = shared.upgrade() {
                    shared.messages.remove(id);
                }
            })),
        }
    }

    pub fn on_connection_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        let id = self.shared.next_observer.fetch_add(1, Ordering::Relaxed);
        self.shared.state_changes.add(id, Arc::new(callback));
        let shared = Arc::downgrade(&self.shared);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(shared) = shared.upgrade() {
                    shared.state_changes.remove(id);
                }
            })),
        }
    }
}

impl EventSink for ConnectionManager {
    fn send(&self, event: ClientEvent) -> bool {
        ConnectionManager::send(self, event)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(task) = self.supervisor.lock().take() {
            task.abort();
        }
    }
}

async fn supervise(shared: Arc<Shared>, url: String, handshake: Handshake, generation: u64) {
    let mut attempt: u32 = 0;

    loop {
        if attempt == 0 && !shared.set_state(generation, ConnectionState::Connecting) {
            return;
        }

        match open(&url, &handshake).await {
            Ok((sink, source, sync)) => {
                shared.backoff.lock().reset();
                attempt = 0;

                let (outbound, pending) = mpsc::unbounded_channel();
                if !shared.attach(generation, outbound) {
                    return;
                }
                info!(
                    "Joined room {} as {}",
                    handshake.room_id, handshake.user_id
                );
                shared.set_state(generation, ConnectionState::Connected);
                shared.messages.notify(&sync);

                match pump(sink, source, pending, &shared).await {
                    Ok(()) => info!("Connection to {} closed", url),
                    Err(e) => warn!("Connection to {} lost: {}", url, e),
                }
                shared.detach(generation);
            }
            Err(ClientError::AuthFailed(reason)) => {
                error!("Server refused {}: {}", handshake.user_id, reason);
                shared.set_state(generation, ConnectionState::Disconnected);
                return;
            }
            Err(e) => warn!("Failed to connect to {}: {}", url, e),
        }

        attempt += 1;
        let delay = shared.backoff.lock().next_delay();
        if !shared.set_state(generation, ConnectionState::Reconnecting { attempt, delay }) {
            return;
        }
        sleep(delay).await;
    }
}

/// Connects and handshakes. The session counts as open once the server
/// answers with `STATE_SYNC`, which is returned for delivery.
async fn open(url: &str, handshake: &Handshake) -> Result<(WsSink, WsSource, ServerEvent), ClientError> {
    let (ws_stream, _) = connect_async(url).await?;
    let (mut sink, mut source) = ws_stream.split();
    sink.send(Message::Binary(encode(handshake)?.into())).await?;

    loop {
        match source.next().await {
            Some(Ok(Message::Binary(data))) => {
                return match decode::<ServerEvent>(&data)? {
                    sync @ ServerEvent::StateSync { .. } => Ok((sink, source, sync)),
                    ServerEvent::Error {
                        code: ErrorCode::AuthFailed,
                        message,
                    } => Err(ClientError::AuthFailed(message)),
                    ServerEvent::Error { message, .. } => Err(ClientError::Handshake(message)),
                    other => Err(ClientError::Handshake(format!(
                        "expected STATE_SYNC, got {:?}",
                        other
                    ))),
                };
            }
            Some(Ok(Message::Close(_))) | None => return Err(ClientError::Closed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

async fn pump(
    mut sink: WsSink,
    mut source: WsSource,
    mut pending: mpsc::UnboundedReceiver<ClientEvent>,
    shared: &Shared,
) -> Result<(), ClientError> {
    loop {
        tokio::select! {
            frame = source.next() => match frame {
                Some(Ok(Message::Binary(data))) => match decode::<ServerEvent>(&data) {
                    Ok(event) => shared.messages.notify(&event),
                    Err(e) => warn!("Dropping undecodable frame: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },

            event = pending.recv() => match event {
                Some(event) => {
                    let bytes = encode(&event)?;
                    sink.send(Message::Binary(bytes.into())).await?;
                }
                None => {
                    let _ = sink.close().await;
                    return Ok(());
                }
            },
        }
    }
}
