//! parleyd - Parley instant-messaging daemon.

use parleyd::config::Config;
use parleyd::state::Switchboard;
use parleyd::store::Database;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config = if std::path::Path::new(&config_path).exists() {
        Config::load(&config_path).map_err(|e| {
            error!(path = %config_path, error = %e, "failed to load config");
            e
        })?
    } else {
        info!(path = %config_path, "config file not found, using defaults");
        Config::default()
    };

    info!(server = %config.server.name, "starting parleyd");

    let store = Arc::new(Database::open(&config.database.path).await?);
    let switchboard = Switchboard::new(config, store)?;

    info!(
        authenticators = ?switchboard.auth.names(),
        validators = ?switchboard.validators.names(),
        "runtime ready; waiting for transport connections"
    );

    tokio::signal::ctrl_c().await?;
    info!("received SIGINT - shutting down");

    switchboard.shutdown().await;
    info!("shutdown complete");
    Ok(())
}
