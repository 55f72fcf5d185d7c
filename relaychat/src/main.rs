mod server;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use relaychat_core::{bootstrap::load_config, logging, LogStore};
use relaychat_hub::{RelayEngine, RelayPolicy};

use server::RelayServer;

/// Two-party chat relay over WebSocket
#[derive(Debug, Parser)]
#[command(name = "relaychat", version, about)]
struct Args {
    /// Path to a YAML config file (defaults to ./config.yaml when present)
    #[arg(short, long, env = "RELAYCHAT_CONFIG_PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load and validate configuration
    let config = load_config(args.config.as_deref())?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("relaychat starting...");
    info!("HTTP address: {}", config.http_address());
    info!(
        path = %config.storage.messages_path.display(),
        "Message log location"
    );

    // 3. Load the message log; an unreadable log starts the relay empty
    let store = LogStore::open(config.storage.messages_path.clone()).await;
    info!(messages = store.len(), "Message log loaded");

    // 4. Build the relay engine
    let policy = RelayPolicy::from(&config.relay);
    info!(persist_failure = ?policy.persist_failure, "Relay policy");
    let engine = RelayEngine::new(store, policy);

    // 5. Serve until a shutdown signal arrives
    let server = RelayServer::new(config, engine);
    server.start().await?;

    info!("relaychat stopped");
    Ok(())
}
