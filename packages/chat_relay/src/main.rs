use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use chat_relay::config::{FileConfig, PeerConfig, RelayConfig, describe_source};
use chat_relay::{RelayServer, client, peer};

#[derive(Parser)]
#[command(name = "chat-relay")]
#[command(about = "Multi-party chat relay over TCP, plus a UDP broadcast peer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./chat-relay.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay in the foreground
    Server(ServerArgs),

    /// Join a relay as an interactive client
    Client(ClientArgs),

    /// Chat with peers on the local network over UDP broadcast
    Peer(PeerArgs),
}

#[derive(Parser)]
struct ServerArgs {
    /// Host to bind to (overrides server.host)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port to listen on (overrides server.port)
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Parser)]
struct ClientArgs {
    /// Relay address, e.g. 127.0.0.1:42069
    addr: String,

    /// Username (prompted for if omitted)
    #[arg(short, long)]
    username: Option<String>,
}

#[derive(Parser)]
struct PeerArgs {
    /// Username (prompted for if omitted)
    #[arg(short, long)]
    username: Option<String>,

    /// UDP port (overrides peer.port)
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug, matches!(cli.command, Commands::Server(_)));

    let file_config = FileConfig::load(cli.config.as_deref())?;
    info!(
        source = %describe_source(cli.config.as_deref()).display(),
        "configuration loaded"
    );

    match cli.command {
        Commands::Server(args) => run_server(args, &file_config).await,
        Commands::Client(args) => {
            client::run_interactive(
                &args.addr,
                args.username,
                file_config.server.max_string_bytes,
            )
            .await
        }
        Commands::Peer(args) => {
            let mut config = PeerConfig::from_file(&file_config.peer)?;
            if let Some(port) = args.port {
                config.port = port;
            }
            peer::run_peer(config, args.username).await
        }
    }
}

/// The interactive modes own stdout for chat lines, so they log to stderr.
fn init_logging(debug: bool, server: bool) {
    let default_directive = if debug {
        "chat_relay=debug,info"
    } else {
        "chat_relay=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));

    let registry = tracing_subscriber::registry().with(env_filter);
    if server {
        registry.with(tracing_subscriber::fmt::layer()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run_server(args: ServerArgs, file_config: &FileConfig) -> Result<()> {
    let mut config = RelayConfig::from_file(&file_config.server)?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    info!(
        history_capacity = config.history_capacity,
        outbound_queue = config.outbound_queue,
        write_timeout = ?config.write_timeout,
        "starting chat relay"
    );

    let server = RelayServer::bind(config).await?;
    let cancel = CancellationToken::new();

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("Received shutdown signal, cleaning up...");
        shutdown.cancel();
    });

    server.run(cancel).await.context("relay stopped with an error")
}
