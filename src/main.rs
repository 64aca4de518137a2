//! Tricktable Game Server
//!
//! Loads configuration from the environment and serves matches over
//! WebSocket until interrupted.

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use tricktable::{history::TracingSink, logging, GameServer, ServerConfig, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let config = ServerConfig::from_env();
    config.validate().context("Invalid configuration")?;

    info!("Tricktable Server v{}", VERSION);
    info!(
        "Win threshold {}, round limit {}, disconnect policy {}",
        config.match_defaults.win_threshold,
        config.match_defaults.max_rounds,
        config.match_defaults.disconnect_policy,
    );

    let server = Arc::new(GameServer::new(config, Arc::new(TracingSink)));

    let signal_server = server.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, shutting down");
                signal_server.shutdown();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    server.run().await.context("Server stopped with an error")?;
    info!("Server stopped");
    Ok(())
}
