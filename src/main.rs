//! gamelink CLI
//!
//! Connects to a game server, authenticates, and relays messages.
//!
//! ## Usage
//!
//! ```bash
//! # Connect with defaults from the config file
//! gamelink --player-name Ada --player-id p-1
//!
//! # Connect to a specific server
//! gamelink --server-url wss://play.example.com/ws --player-name Ada --player-id p-1
//! ```
//!
//! Each stdin line is sent as a raw wire frame; write `\n` for the separator
//! between kind and payload, e.g. `WarningMessage\n{}`. Session events are
//! printed as JSON lines. Ctrl-C or end of input shuts down.

use anyhow::Context;
use clap::Parser;
use gamelink::config::default_config_path;
use gamelink::{Config, LinkClient, LinkClientConfig, WsTransportFactory};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gamelink")]
#[command(about = "Resilient WebSocket client for a game server")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Game server WebSocket URL
    #[arg(long, env = "GAMELINK_SERVER_URL")]
    server_url: Option<String>,

    /// Player name sent when authenticating
    #[arg(long, env = "GAMELINK_PLAYER_NAME")]
    player_name: String,

    /// Player ID sent when authenticating
    #[arg(long, env = "GAMELINK_PLAYER_ID")]
    player_id: String,

    /// Game version sent when authenticating
    #[arg(long, env = "GAMELINK_GAME_VERSION", default_value = env!("CARGO_PKG_VERSION"))]
    game_version: String,

    /// Seconds between latency probes
    #[arg(long)]
    ping_interval_secs: Option<u64>,

    /// Write the effective config to the config path and exit
    #[arg(long)]
    save_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("gamelink=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let mut config = if config_path.exists() {
        Config::load(&config_path)
            .with_context(|| format!("loading config from {}", config_path.display()))?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(url) = args.server_url {
        config.server_url = url;
    }
    if let Some(secs) = args.ping_interval_secs {
        config.ping_interval_secs = secs;
    }
    config.validate()?;

    if args.save_config {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Saved config");
        return Ok(());
    }

    info!(
        server = %config.friendly_server_name,
        url = %config.server_url,
        "Starting gamelink"
    );

    let client = LinkClient::start(LinkClientConfig::from(&config), Arc::new(WsTransportFactory));

    let mut events = client.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!(error = %e, "Failed to serialize event"),
                },
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    client
        .initialise(&args.player_name, &args.player_id, &args.game_version)
        .await
        .context("initialising session")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => client.send_raw(line.replace("\\n", "\n"))?,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    client.shutdown().await?;
    printer.abort();
    info!("Goodbye");
    Ok(())
}
