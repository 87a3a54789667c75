//! Integration tests for the room server and its clients
//!
//! Every test runs a real server on an ephemeral port and talks to it over
//! WebSockets, either through the client library or with raw frames.

use client::{ConnectionManager, ConnectionState, Reconciler, SceneSwitcher};
use futures_util::{SinkExt, StreamExt};
use server::config::ServerConfig;
use server::coordinator::RoomCommand;
use server::network::Server;
use server::registry::RoomRegistry;
use shared::protocol::{decode, encode};
use shared::{
    CellKey, ClientEvent, ErrorCode, Handshake, MemoryStore, NewToken, Position, Room,
    RoomConfig, Scene, SceneContent, SceneStore, ServerEvent,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

struct TestServer {
    addr: SocketAddr,
    registry: Arc<RoomRegistry>,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(ServerConfig::default()).await
    }

    async fn start_with(config: ServerConfig) -> Self {
        let server = Server::new(
            config.with_bind_addr("127.0.0.1:0"),
            Arc::new(MemoryStore::new()),
        )
        .await
        .expect("Failed to start server");
        let addr = server.local_addr().unwrap();
        let registry = server.registry();
        tokio::spawn(server.run());
        Self { addr, registry }
    }

    fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    async fn room(&self, room_id: &str) -> Room {
        self.registry
            .snapshot(room_id)
            .await
            .expect("room is not running")
    }
}

struct TestClient {
    connection: Arc<ConnectionManager>,
    reconciler: Reconciler<ConnectionManager>,
    _feed: client::Subscription,
}

impl TestClient {
    async fn join(server: &TestServer, room_id: &str, user_id: &str) -> Self {
        let connection = Arc::new(ConnectionManager::new(server.url()));
        let reconciler = Reconciler::new(Arc::clone(&connection));
        let feed = reconciler.follow();
        connection.connect(room_id, user_id, "");

        let client = Self {
            connection,
            reconciler,
            _feed: feed,
        };
        client.wait_for_sync().await;
        client
    }

    async fn wait_for_sync(&self) {
        eventually("state sync", || {
            self.connection.is_connected() && self.reconciler.snapshot().is_some()
        })
        .await;
    }

    fn room(&self) -> Room {
        self.reconciler.snapshot().expect("no room state")
    }

    fn token_id(&self, label: &str) -> Option<String> {
        self.reconciler
            .snapshot()?
            .tokens
            .into_iter()
            .find(|t| t.label == label)
            .map(|t| t.id)
    }

    async fn add_token(&self, label: &str, owner: Option<&str>, position: Position) -> String {
        let mut token = NewToken::new(label, position);
        token.owner_user_id = owner.map(str::to_string);
        self.reconciler
            .submit(ClientEvent::AddToken { token })
            .expect("add token");

        eventually("token added", || self.token_id(label).is_some()).await;
        self.token_id(label).unwrap()
    }
}

async fn eventually<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(3);
    while !condition() {
        if Instant::now() > deadline {
            panic!("Timed out waiting for {}", what);
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// AUTHORITY TESTS
mod authority_tests {
    use super::*;

    #[tokio::test]
    async fn first_joiner_moderates_and_fog_reaches_players() {
        let server = TestServer::start().await;
        let gm = TestClient::join(&server, "crypt", "gm").await;
        let alice = TestClient::join(&server, "crypt", "alice").await;

        assert!(gm.reconciler.role().unwrap().is_moderator());
        assert!(!alice.reconciler.role().unwrap().is_moderator());

        assert!(gm
            .reconciler
            .paint_fog(vec![CellKey::new(1, 1), CellKey::new(1, 2)], false));

        eventually("fog at player", || alice.room().fog_state.len() == 2).await;
        assert!(alice.room().fog_state.is_revealed(CellKey::new(1, 2)));
        assert_eq!(server.room("crypt").await.fog_state, gm.room().fog_state);
    }

    #[tokio::test]
    async fn player_fog_request_is_refused() {
        let server = TestServer::start().await;
        let gm = TestClient::join(&server, "crypt", "gm").await;
        let alice = TestClient::join(&server, "crypt", "alice").await;

        // The local check refuses before anything is sent.
        assert!(!alice.reconciler.paint_fog(vec![CellKey::new(0, 0)], false));

        // A request that skips the local check is refused by the server.
        assert!(alice.connection.send(ClientEvent::RevealFog {
            cells: vec![CellKey::new(0, 0)],
            erase: false,
        }));
        eventually("error reply", || alice.reconciler.last_error().is_some()).await;

        let (code, _) = alice.reconciler.last_error().unwrap();
        assert_eq!(code, ErrorCode::Unauthorized);
        assert!(server.room("crypt").await.fog_state.is_empty());
        assert!(gm.reconciler.last_error().is_none());
    }

    #[tokio::test]
    async fn non_owner_move_leaves_token_in_place() {
        let server = TestServer::start().await;
        let gm = TestClient::join(&server, "crypt", "gm").await;
        let alice = TestClient::join(&server, "crypt", "alice").await;

        let troll = gm
            .add_token("Troll", Some("bob"), Position::new(100.0, 100.0))
            .await;
        eventually("token at player", || alice.token_id("Troll").is_some()).await;

        assert!(alice.connection.send(ClientEvent::MoveTokenRequest {
            token_id: troll.clone(),
            position: Position::new(500.0, 500.0),
        }));
        sleep(Duration::from_millis(200)).await;

        let position = server.room("crypt").await.token(&troll).unwrap().position;
        assert_eq!(position, Position::new(100.0, 100.0));
        // Rejected moves get no reply at all.
        assert!(alice.reconciler.last_error().is_none());
    }
}

/// RECONCILIATION TESTS
mod reconciliation_tests {
    use super::*;

    #[tokio::test]
    async fn release_converges_every_copy() {
        let server = TestServer::start().await;
        let gm = TestClient::join(&server, "crypt", "gm").await;
        let alice = TestClient::join(&server, "crypt", "alice").await;

        let fighter = alice
            .add_token("Fighter", None, Position::new(0.0, 0.0))
            .await;
        eventually("token at moderator", || gm.token_id("Fighter").is_some()).await;

        for step in 1..=5 {
            let x = step as f64 * 10.0;
            assert!(alice.reconciler.drag_token(&fighter, Position::new(x, x)));
        }
        assert!(alice
            .reconciler
            .release_token(&fighter, Position::new(123.0, 77.0)));

        // Snapped to the 50px grid locally before the echo arrives.
        assert_eq!(
            alice.room().token(&fighter).unwrap().position,
            Position::new(100.0, 100.0)
        );

        let expected = Position::new(100.0, 100.0);
        eventually("moderator copy", || {
            gm.room().token(&fighter).map(|t| t.position) == Some(expected)
        })
        .await;
        sleep(Duration::from_millis(150)).await;

        let committed = server.room("crypt").await;
        assert_eq!(committed.token(&fighter).unwrap().position, expected);
        assert_eq!(alice.room().tokens, committed.tokens);
        assert_eq!(gm.room().tokens, committed.tokens);
    }

    #[tokio::test]
    async fn rejoin_state_sync_matches_committed_room() {
        let server = TestServer::start().await;
        let gm = TestClient::join(&server, "crypt", "gm").await;
        let alice = TestClient::join(&server, "crypt", "alice").await;

        alice.connection.disconnect();
        assert_eq!(alice.connection.state(), ConnectionState::Disconnected);
        eventually("leave noticed", || {
            !gm.room().connected_user_ids.contains("alice")
        })
        .await;

        // Changes made while alice is away.
        gm.add_token("Orc", None, Position::new(50.0, 50.0)).await;
        assert!(gm.reconciler.paint_fog(vec![CellKey::new(3, 3)], false));
        eventually("fog committed", || gm.room().fog_state.len() == 1).await;

        // Offline sends are dropped rather than queued.
        assert!(!alice.connection.send(ClientEvent::ResetFog));

        alice.connection.connect("crypt", "alice", "");
        eventually("resync", || {
            alice.connection.is_connected() && alice.token_id("Orc").is_some()
        })
        .await;

        let committed = server.room("crypt").await;
        let local = alice.room();
        assert_eq!(local.tokens, committed.tokens);
        assert_eq!(local.fog_state, committed.fog_state);
        assert_eq!(local.config, committed.config);
        assert!(local.connected_user_ids.contains("alice"));
    }

    #[tokio::test]
    async fn dropped_session_reconnects_and_resyncs() {
        let server = TestServer::start().await;
        let gm = TestClient::join(&server, "crypt", "gm").await;
        let alice = TestClient::join(&server, "crypt", "alice").await;

        let fighter = alice
            .add_token("Fighter", None, Position::new(0.0, 0.0))
            .await;
        eventually("token at moderator", || gm.token_id("Fighter").is_some()).await;

        let states = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let recorded = Arc::clone(&states);
        let _watch = alice
            .connection
            .on_connection_change(move |state| recorded.lock().push(*state));

        // Sessions are numbered in join order; the room drops alice's.
        server
            .registry
            .dispatch("crypt", RoomCommand::Leave { session_id: 2 });
        eventually("connection lost", || {
            matches!(alice.connection.state(), ConnectionState::Reconnecting { .. })
        })
        .await;

        // Local moves while away are applied but never delivered.
        assert!(alice.reconciler.drag_token(&fighter, Position::new(300.0, 300.0)));
        assert!(!alice
            .reconciler
            .release_token(&fighter, Position::new(400.0, 400.0)));
        assert_eq!(
            alice.room().token(&fighter).unwrap().position,
            Position::new(400.0, 400.0)
        );

        assert!(gm
            .reconciler
            .release_token(&fighter, Position::new(150.0, 50.0)));
        assert!(gm.reconciler.paint_fog(vec![CellKey::new(2, 2)], false));
        eventually("moderator changes committed", || {
            gm.room().fog_state.len() == 1
                && gm.room().token(&fighter).map(|t| t.position)
                    == Some(Position::new(150.0, 50.0))
        })
        .await;

        eventually("automatic reconnect", || {
            alice.connection.is_connected()
                && alice.room().fog_state.is_revealed(CellKey::new(2, 2))
        })
        .await;
        sleep(Duration::from_millis(150)).await;

        let committed = server.room("crypt").await;
        let local = alice.room();
        assert_eq!(local.tokens, committed.tokens);
        assert_eq!(local.fog_state, committed.fog_state);
        assert_eq!(local.config, committed.config);
        assert_eq!(
            local.token(&fighter).unwrap().position,
            Position::new(150.0, 50.0)
        );
        assert!(committed.connected_user_ids.contains("alice"));

        let seen = states.lock().clone();
        assert!(seen.contains(&ConnectionState::Reconnecting {
            attempt: 1,
            delay: Duration::from_secs(1),
        }));
        assert_eq!(seen.last(), Some(&ConnectionState::Connected));
    }

    #[tokio::test]
    async fn add_remove_replay_matches_fresh_sync() {
        let server = TestServer::start().await;
        let gm = TestClient::join(&server, "crypt", "gm").await;

        let mut ids = Vec::new();
        for label in ["Goblin", "Wolf", "Bat"] {
            ids.push(gm.add_token(label, None, Position::new(0.0, 0.0)).await);
        }
        gm.reconciler
            .submit(ClientEvent::RemoveToken {
                token_id: ids[1].clone(),
            })
            .unwrap();
        eventually("token removed", || gm.token_id("Wolf").is_none()).await;

        let late = TestClient::join(&server, "crypt", "carol").await;
        assert_eq!(late.room().token_ids(), gm.room().token_ids());
        assert_eq!(late.room().tokens.len(), 2);
    }
}

/// SCENE SWITCH TESTS
mod scene_tests {
    use super::*;

    fn troll_scene() -> Scene {
        let mut scene = Scene::new("b", "crypt", "Cave", 1);
        scene.content = SceneContent {
            config: RoomConfig {
                grid_size: 40,
                fog_enabled: true,
                ..RoomConfig::default()
            },
            fog_state: [CellKey::new(7, 7)].into_iter().collect(),
            tokens: vec![NewToken::new("Troll", Position::new(80.0, 80.0))
                .into_token("t3".to_string(), "gm".to_string())],
        };
        scene
    }

    #[tokio::test]
    async fn switch_replaces_live_room_and_saves_previous_scene() {
        let server = TestServer::start().await;
        let gm = TestClient::join(&server, "crypt", "gm").await;
        let alice = TestClient::join(&server, "crypt", "alice").await;

        gm.add_token("Fighter", Some("alice"), Position::new(0.0, 0.0)).await;
        gm.add_token("Orc", None, Position::new(50.0, 50.0)).await;

        let store = Arc::new(MemoryStore::new());
        store.save_scene(&Scene::new("a", "crypt", "Town", 0)).await.unwrap();
        store.save_scene(&troll_scene()).await.unwrap();

        let scenes = SceneSwitcher::new(gm.reconciler.clone(), Arc::clone(&store));
        scenes.set_current(Some("a".to_string()));
        scenes.switch_to("b").await.unwrap();

        eventually("scene at player", || {
            alice.room().config.grid_size == 40 && alice.token_id("Troll").is_some()
        })
        .await;

        let live = server.room("crypt").await;
        let labels: Vec<&str> = live.tokens.iter().map(|t| t.label.as_str()).collect();
        assert_eq!(labels, vec!["Troll"]);
        assert_eq!(live.config.grid_size, 40);
        assert!(live.config.fog_enabled);
        assert_eq!(live.fog_state.cells(), vec![CellKey::new(7, 7)]);
        assert_eq!(alice.room().tokens, live.tokens);
        assert!(!alice.reconciler.role().unwrap().is_moderator());

        let saved = store.load_scene("a").await.unwrap();
        let mut saved_labels: Vec<&str> =
            saved.content.tokens.iter().map(|t| t.label.as_str()).collect();
        saved_labels.sort();
        assert_eq!(saved_labels, vec!["Fighter", "Orc"]);
        assert_eq!(scenes.current(), Some("b".to_string()));
    }
}

/// WIRE TESTS
mod wire_tests {
    use super::*;

    async fn next_event<S>(source: &mut S) -> ServerEvent
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            let frame = timeout(Duration::from_secs(2), source.next())
                .await
                .expect("timed out")
                .expect("stream ended")
                .expect("socket error");
            if let Message::Binary(data) = frame {
                return decode(&data).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn text_frame_is_malformed() {
        let server = TestServer::start().await;
        let (mut ws, _) = connect_async(server.url()).await.unwrap();

        let handshake = Handshake {
            room_id: "crypt".to_string(),
            user_id: "gm".to_string(),
            auth_token: String::new(),
        };
        ws.send(Message::Binary(encode(&handshake).unwrap().into()))
            .await
            .unwrap();
        assert!(matches!(
            next_event(&mut ws).await,
            ServerEvent::StateSync { .. }
        ));

        ws.send(Message::Text("MOVE_TOKEN_REQUEST".into()))
            .await
            .unwrap();
        match next_event(&mut ws).await {
            ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::Malformed),
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn refused_credentials_stop_reconnecting() {
        let server = TestServer::start_with(ServerConfig::default().with_token("gm", "dragon")).await;
        let connection = Arc::new(ConnectionManager::new(server.url()));
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let _status = connection.on_connection_change(move |state| recorder.lock().push(*state));
        connection.connect("crypt", "gm", "kobold");

        eventually("refusal", || {
            seen.lock().last() == Some(&ConnectionState::Disconnected)
        })
        .await;
        sleep(Duration::from_millis(100)).await;

        assert_eq!(
            *seen.lock(),
            vec![ConnectionState::Connecting, ConnectionState::Disconnected]
        );
        assert!(!server.registry.is_running("crypt"));
    }
}
