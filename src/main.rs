//! weft daemon binary
//!
//! Loads configuration, restores or generates the node identity, and
//! runs a mesh node over the UDP stand-in link. Lines typed on stdin go
//! out as broadcast messages; node events are logged as they arrive.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};
use weft::{
    link_event_channel, Config, Event, FileKeyStore, Node, NodeIdentity, UdpLink,
};

/// weft mesh node daemon
#[derive(Parser, Debug)]
#[command(name = "weft", version, about)]
struct Args {
    /// Path to configuration file (overrides default search paths)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Nickname to announce (overrides configuration)
    #[arg(short, long)]
    nickname: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();

    info!("weft starting");

    // Load configuration
    let (config, loaded_paths) = if let Some(config_path) = &args.config {
        match Config::load_file(config_path) {
            Ok(config) => (config, vec![config_path.clone()]),
            Err(e) => {
                error!("Failed to load configuration from {}: {}", config_path.display(), e);
                std::process::exit(1);
            }
        }
    } else {
        match Config::load() {
            Ok(result) => result,
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                std::process::exit(1);
            }
        }
    };

    if loaded_paths.is_empty() {
        info!("No config files found, using defaults");
    } else {
        for path in &loaded_paths {
            info!(path = %path.display(), "Loaded config file");
        }
    }

    // Restore or generate the identity
    let mut keystore = FileKeyStore::new(config.keystore_path());
    let identity = match NodeIdentity::load_or_generate(&mut keystore) {
        Ok(identity) => identity,
        Err(e) => {
            error!("Failed to load identity: {}", e);
            std::process::exit(1);
        }
    };

    // Wire the UDP link to the node
    let (link_tx, link_rx) = link_event_channel(config.channel_buffer());
    let driver = Arc::new(UdpLink::new(config.udp_link(), link_tx));
    let (mut node, mut events) = Node::new(config, identity, driver, link_rx);

    info!("Node created:");
    info!("   short_id: {}", node.short_id());
    info!("   fingerprint: {}", node.identity().fingerprint());
    info!("   nickname: {}", node.identity().nickname());

    if let Err(e) = node.start(args.nickname.as_deref()) {
        error!("Failed to start node: {}", e);
        std::process::exit(1);
    }

    let handle = node.handle();
    let node_task = tokio::spawn(async move { node.run().await });

    // Event logger
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                Event::MessageReceived {
                    sender_nickname,
                    content,
                    is_private,
                    ..
                } => {
                    if is_private {
                        info!("[private] <{}> {}", sender_nickname, content);
                    } else {
                        info!("<{}> {}", sender_nickname, content);
                    }
                }
                Event::PeerListUpdated { peers } => {
                    let names: Vec<String> = peers.iter().map(|p| p.display_name()).collect();
                    info!(count = peers.len(), "peers: {}", names.join(", "));
                }
                Event::FileReceived {
                    file_name,
                    file_size,
                    sender,
                    ..
                } => {
                    info!(file = %file_name, bytes = file_size, from = %sender, "file received");
                }
                Event::Error { code, message } => {
                    warn!(code = %code, "{}", message);
                }
                other => {
                    info!(event = other.name(), "event");
                }
            }
        }
    });

    // Stdin lines become broadcast messages
    let stdin_handle = handle.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            if let Err(e) = stdin_handle.send_broadcast(line).await {
                warn!("send failed: {}", e);
                break;
            }
        }
    });

    info!("weft running, press Ctrl+C to exit");

    tokio::select! {
        result = node_task => {
            match result {
                Ok(Ok(())) => info!("node loop exited"),
                Ok(Err(e)) => error!("node loop error: {}", e),
                Err(e) => error!("node task panicked: {}", e),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            if let Err(e) = handle.stop().await {
                warn!("Error during shutdown: {}", e);
            }
        }
    }

    info!("weft shutdown complete");
}
