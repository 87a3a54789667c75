use clap::Parser;
use client::{
    BrushMode, ConnectionManager, ConnectionState, FogPainter, Reconciler, SceneSwitcher,
    SwitchMode,
};
use log::{info, warn};
use shared::{ClientEvent, MemoryStore, NewToken, Position};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Room server WebSocket address
    #[arg(short = 's', long, default_value = "ws://127.0.0.1:8080")]
    server: String,

    /// Room to join
    #[arg(short = 'r', long, default_value = "lobby")]
    room: String,

    /// User id to join as
    #[arg(short = 'u', long)]
    user: String,

    /// Secret presented at handshake
    #[arg(short = 'a', long, default_value = "")]
    auth_token: String,

    /// Fog brush radius in cells
    #[arg(short = 'b', long, default_value = "1")]
    brush_radius: u32,

    /// Replay scene switches as individual requests instead of LOAD_SCENE
    #[arg(long)]
    scripted_scenes: bool,
}

enum Command {
    Drag(String, Position),
    Move(String, Position),
    Paint(BrushMode, f64, f64),
    Brush(u32),
    ResetFog,
    Add(String, Position),
    Remove(String),
    Save(String),
    Scene(String),
    State,
    Quit,
}

const HELP: &str = "commands: drag|move <token> <x> <y>, reveal|erase <x> <y>, brush <radius>, \
reset, add <label> <x> <y>, remove <token>, save <scene>, scene <scene>, state, quit";

fn parse_command(line: &str) -> Result<Command, String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let number = |i: usize| -> Result<f64, String> {
        words
            .get(i)
            .ok_or_else(|| "missing coordinate".to_string())?
            .parse::<f64>()
            .map_err(|e| e.to_string())
    };
    let word = |i: usize| -> Result<String, String> {
        words
            .get(i)
            .map(|w| w.to_string())
            .ok_or_else(|| "missing argument".to_string())
    };

    match words.first().copied() {
        Some("drag") => Ok(Command::Drag(word(1)?, Position::new(number(2)?, number(3)?))),
        Some("move") => Ok(Command::Move(word(1)?, Position::new(number(2)?, number(3)?))),
        Some("reveal") => Ok(Command::Paint(BrushMode::Reveal, number(1)?, number(2)?)),
        Some("erase") => Ok(Command::Paint(BrushMode::Erase, number(1)?, number(2)?)),
        Some("brush") => word(1)?
            .parse()
            .map(Command::Brush)
            .map_err(|_| "radius must be a whole number".to_string()),
        Some("reset") => Ok(Command::ResetFog),
        Some("add") => Ok(Command::Add(word(1)?, Position::new(number(2)?, number(3)?))),
        Some("remove") => Ok(Command::Remove(word(1)?)),
        Some("save") => Ok(Command::Save(word(1)?)),
        Some("scene") => Ok(Command::Scene(word(1)?)),
        Some("state") => Ok(Command::State),
        Some("quit") | Some("exit") => Ok(Command::Quit),
        _ => Err(HELP.to_string()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let connection = Arc::new(ConnectionManager::new(args.server.clone()));
    let reconciler = Reconciler::new(Arc::clone(&connection));
    let _feed = reconciler.follow();
    let _status = connection.on_connection_change(|state| match state {
        ConnectionState::Reconnecting { attempt, delay } => {
            warn!("Connection lost, retry {} in {:?}", attempt, delay)
        }
        other => info!("Connection: {:?}", other),
    });

    let mode = if args.scripted_scenes {
        SwitchMode::Scripted
    } else {
        SwitchMode::Atomic
    };
    let scenes = SceneSwitcher::with_mode(reconciler.clone(), Arc::new(MemoryStore::new()), mode);
    let mut painter = FogPainter::new(args.brush_radius);

    connection.connect(&args.room, &args.user, &args.auth_token);
    info!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match parse_command(&line) {
            Ok(command) => command,
            Err(message) => {
                eprintln!("{}", message);
                continue;
            }
        };

        match command {
            Command::Drag(token_id, position) => {
                if !reconciler.drag_token(&token_id, position) {
                    eprintln!("cannot move {}", token_id);
                }
            }
            Command::Move(token_id, position) => {
                if !reconciler.release_token(&token_id, position) {
                    eprintln!("cannot move {}", token_id);
                }
            }
            Command::Paint(mode, x, y) => {
                painter.set_mode(mode);
                painter.begin_stroke();
                if !painter.paint(&reconciler, x, y) {
                    eprintln!("nothing painted");
                }
                painter.end_stroke();
            }
            Command::Brush(radius) => painter.set_radius(radius),
            Command::ResetFog => {
                if let Err(e) = reconciler.submit(ClientEvent::ResetFog) {
                    eprintln!("{}", e);
                }
            }
            Command::Add(label, position) => {
                let event = ClientEvent::AddToken {
                    token: NewToken::new(label, position),
                };
                if let Err(e) = reconciler.submit(event) {
                    eprintln!("{}", e);
                }
            }
            Command::Remove(token_id) => {
                if let Err(e) = reconciler.submit(ClientEvent::RemoveToken { token_id }) {
                    eprintln!("{}", e);
                }
            }
            Command::Save(scene_id) => {
                scenes.set_current(Some(scene_id));
                match scenes.save_current().await {
                    Ok(scene) => println!("saved scene {}", scene.id),
                    Err(e) => eprintln!("{}", e),
                }
            }
            Command::Scene(scene_id) => match scenes.switch_to(&scene_id).await {
                Ok(()) => println!("switched to scene {}", scene_id),
                Err(e) => eprintln!("{}", e),
            },
            Command::State => match reconciler.snapshot() {
                Some(room) => {
                    println!(
                        "room {} (moderator {}), {} users online, {} revealed cells",
                        room.id,
                        room.moderator_user_id,
                        room.connected_user_ids.len(),
                        room.fog_state.len()
                    );
                    for token in &room.tokens {
                        println!(
                            "  {} {:?} owned by {} at ({:.1}, {:.1})",
                            token.id, token.label, token.owner_user_id, token.position.x, token.position.y
                        );
                    }
                }
                None => println!("no state yet ({:?})", connection.state()),
            },
            Command::Quit => break,
        }
    }

    connection.disconnect();
    Ok(())
}
