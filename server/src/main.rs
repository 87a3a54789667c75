use clap::Parser;
use log::{error, info};
use server::config::ServerConfig;
use server::network::{BoxError, Server};
use shared::MemoryStore;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "8080")]
    port: u16,
    /// Seconds an empty room stays loaded before it is evicted
    #[clap(long, default_value = "60")]
    idle_grace_secs: u64,
    /// Outbound queue length per session
    #[clap(long, default_value = "256")]
    outbound_capacity: usize,
    /// Require USER=SECRET at handshake; repeat for more users
    #[clap(long = "token", value_parser = parse_token)]
    tokens: Vec<(String, String)>,
}

fn parse_token(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((user, secret)) if !user.is_empty() => Ok((user.to_string(), secret.to_string())),
        _ => Err(format!("expected USER=SECRET, got {:?}", raw)),
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::init();
    let args = Args::parse();

    let mut config = ServerConfig::default()
        .with_bind_addr(format!("{}:{}", args.host, args.port))
        .with_idle_grace(Duration::from_secs(args.idle_grace_secs));
    config.outbound_capacity = args.outbound_capacity;
    for (user, secret) in args.tokens {
        config = config.with_token(user, secret);
    }

    if config.auth_tokens.is_empty() {
        info!("No tokens configured, accepting every handshake");
    }

    let server = Server::new(config, Arc::new(MemoryStore::new())).await?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = &result {
                error!("Server stopped: {}", e);
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    }
}
