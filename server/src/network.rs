//! WebSocket front door.
//!
//! Each accepted connection becomes one session: upgrade, read the
//! handshake, authenticate, then relay frames between the socket and the
//! room's coordinator until either side goes away. Sessions never touch room
//! state directly.

use crate::auth::Authenticator;
use crate::client_manager::SessionId;
use crate::config::ServerConfig;
use crate::coordinator::RoomCommand;
use crate::registry::RoomRegistry;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::protocol::{decode, encode};
use shared::{ClientEvent, ErrorCode, Handshake, RoomStore, ServerEvent};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// What every session task needs, shared across connections.
struct SessionContext {
    registry: Arc<RoomRegistry>,
    authenticator: Arc<dyn Authenticator>,
    outbound_capacity: usize,
    handshake_timeout: Duration,
}

pub struct Server {
    listener: TcpListener,
    context: Arc<SessionContext>,
    next_session_id: SessionId,
}

impl Server {
    /// Binds the listener described by `config`.
    pub async fn new(config: ServerConfig, store: Arc<dyn RoomStore>) -> Result<Self, BoxError> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        info!("Server listening on {}", listener.local_addr()?);

        let context = SessionContext {
            registry: Arc::new(RoomRegistry::new(store, config.idle_grace)),
            authenticator: config.authenticator(),
            outbound_capacity: config.outbound_capacity.max(1),
            handshake_timeout: config.handshake_timeout,
        };

        Ok(Self {
            listener,
            context: Arc::new(context),
            next_session_id: 1,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<RoomRegistry> {
        Arc::clone(&self.context.registry)
    }

    /// Accepts connections forever, one task per session.
    pub async fn run(mut self) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            };
            debug!("New TCP connection from {}", addr);

            let session_id = self.next_session_id;
            self.next_session_id += 1;
            let context = Arc::clone(&self.context);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, session_id, context).await {
                    warn!("Session {} from {} ended with error: {}", session_id, addr, e);
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    session_id: SessionId,
    context: Arc<SessionContext>,
) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut source) = ws_stream.split();

    let handshake = match timeout(context.handshake_timeout, read_handshake(&mut source)).await {
        Ok(Ok(handshake)) => handshake,
        Ok(Err(e)) => {
            warn!("Bad handshake from {}: {}", addr, e);
            let reply = ServerEvent::error(ErrorCode::Malformed, e.to_string());
            send_event(&mut sink, &reply).await?;
            let _ = sink.close().await;
            return Ok(());
        }
        Err(_) => {
            warn!("No handshake from {} within {:?}", addr, context.handshake_timeout);
            let _ = sink.close().await;
            return Ok(());
        }
    };

    if !context.authenticator.authenticate(&handshake) {
        let reply = ServerEvent::error(ErrorCode::AuthFailed, "authentication failed");
        send_event(&mut sink, &reply).await?;
        let _ = sink.close().await;
        return Ok(());
    }

    let Handshake {
        room_id, user_id, ..
    } = handshake;
    info!(
        "Session {} from {}: {} joining room {}",
        session_id, addr, user_id, room_id
    );

    let (outbound, mut events) = mpsc::channel(context.outbound_capacity);
    context.registry.dispatch(
        &room_id,
        RoomCommand::Join {
            session_id,
            user_id,
            outbound,
        },
    );

    let result = relay(
        session_id,
        &room_id,
        &context.registry,
        &mut sink,
        &mut source,
        &mut events,
    )
    .await;

    context
        .registry
        .dispatch(&room_id, RoomCommand::Leave { session_id });
    info!("Session {} closed", session_id);
    result
}

/// Moves frames both ways until the socket closes or the room lets go of
/// the session.
async fn relay(
    session_id: SessionId,
    room_id: &str,
    registry: &RoomRegistry,
    sink: &mut WsSink,
    source: &mut WsSource,
    events: &mut mpsc::Receiver<Arc<ServerEvent>>,
) -> Result<(), BoxError> {
    loop {
        tokio::select! {
            frame = source.next() => match frame {
                Some(Ok(Message::Binary(data))) => match decode::<ClientEvent>(&data) {
                    Ok(event) => {
                        registry.dispatch(room_id, RoomCommand::Request { session_id, event });
                    }
                    Err(e) => {
                        warn!("Session {}: {}", session_id, e);
                        let reply = ServerEvent::error(ErrorCode::Malformed, e.to_string());
                        send_event(sink, &reply).await?;
                    }
                },
                Some(Ok(Message::Text(_))) => {
                    warn!("Session {}: text frame ignored", session_id);
                    let reply = ServerEvent::error(ErrorCode::Malformed, "expected a binary frame");
                    send_event(sink, &reply).await?;
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },

            event = events.recv() => match event {
                Some(event) => send_event(sink, &event).await?,
                None => {
                    // Room dropped the session: it fell behind or the room died.
                    info!("Session {} released by room {}", session_id, room_id);
                    let _ = sink.close().await;
                    return Ok(());
                }
            },
        }
    }
}

async fn read_handshake(source: &mut WsSource) -> Result<Handshake, BoxError> {
    loop {
        match source.next().await {
            Some(Ok(Message::Binary(data))) => return Ok(decode::<Handshake>(&data)?),
            Some(Ok(Message::Close(_))) | None => {
                return Err("connection closed before handshake".into())
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

async fn send_event(sink: &mut WsSink, event: &ServerEvent) -> Result<(), BoxError> {
    let bytes = encode(event)?;
    sink.send(Message::Binary(bytes.into())).await?;
    Ok(())
}
