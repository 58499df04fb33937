//! warkeep daemon — starts the game API server, the completion worker, and
//! the write-behind sync workers.

use anyhow::{Context, Result};
use tracing::info;

use wk_core::config::ServerConfig;
use wk_daemon::{logging, Daemon};

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_logging("wk-daemon", "info");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "./warkeep.toml".to_string());
    let config = ServerConfig::load(&config_path)
        .with_context(|| format!("failed to load config from {config_path}"))?;
    info!(config_path = %config_path, "warkeep daemon starting");

    let daemon = Daemon::new(config).await?;

    // ctrl-c triggers the graceful path: stop intake, drain workers.
    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received");
            shutdown.trigger();
        }
    });

    daemon.run().await
}
