use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tandem_client::{BridgeEndpoint, ClientConfig, PlayerCommand, PlayerEndpoint, PlayerState, Session};

const BRIDGE_QUEUE: usize = 64;

/// Joins a tandem room and bridges a local player over stdin/stdout JSON lines.
#[derive(Debug, Parser)]
#[command(name = "tandem-client", version)]
struct Args {
    /// Config file; created with defaults when missing.
    #[arg(long, env = "TANDEM_CONFIG")]
    config: Option<PathBuf>,
    /// Create a room and host it.
    #[arg(long, conflicts_with = "join")]
    create: bool,
    /// Join the room with this code.
    #[arg(long, value_name = "CODE")]
    join: Option<String>,
    /// Display name shown to other members; saved to the config.
    #[arg(long)]
    name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tandem_client=debug,info".into()),
        )
        .init();

    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(ClientConfig::default_path);
    let mut config = ClientConfig::load_or_init(&config_path)?;
    if let Some(name) = args.name {
        config.display_name = name.trim().to_string();
        config.save(&config_path)?;
    }
    tracing::info!("Using config {} server={}", config_path.display(), config.server_url);

    let (bridge, commands) = BridgeEndpoint::new("stdio", BRIDGE_QUEUE);
    let bridge = Arc::new(bridge);
    let (session, driver) = Session::new(config, bridge.clone());

    if args.create {
        session.create_room();
    } else if let Some(code) = args.join.as_deref() {
        session.join_room(code);
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown requested");
                signal.cancel();
            }
            Err(e) => tracing::error!("Failed to listen for ctrl-c: {}", e),
        }
    });

    tokio::spawn(read_player_states(bridge, shutdown.clone()));
    tokio::spawn(write_player_commands(commands, shutdown.clone()));

    // The relay treats the dropped connection as leaving the room.
    session.run(driver, shutdown).await;
    Ok(())
}

/// Each stdin line is one JSON `PlayerState` pushed by the player.
async fn read_player_states(bridge: Arc<BridgeEndpoint>, shutdown: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match serde_json::from_str::<PlayerState>(&line) {
                Ok(state) => bridge.update_player_state(state),
                Err(e) => tracing::warn!("Ignoring malformed player state: {}", e),
            },
            Ok(None) => {
                tracing::info!("Player input closed");
                break;
            }
            Err(e) => {
                tracing::error!("Failed to read player input: {}", e);
                break;
            }
        }
    }
}

/// Writes each command for the player as one JSON line on stdout.
async fn write_player_commands(
    mut commands: mpsc::Receiver<PlayerCommand>,
    shutdown: CancellationToken,
) {
    let mut stdout = tokio::io::stdout();
    loop {
        let command = tokio::select! {
            _ = shutdown.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };
        if let Err(e) = write_command(&mut stdout, &command).await {
            tracing::error!("Failed to write player command: {:#}", e);
            break;
        }
    }
}

async fn write_command(stdout: &mut tokio::io::Stdout, command: &PlayerCommand) -> Result<()> {
    let mut line = serde_json::to_vec(command).context("encode command")?;
    line.push(b'\n');
    stdout.write_all(&line).await.context("write command")?;
    stdout.flush().await.context("flush stdout")
}
