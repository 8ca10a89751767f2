//! DEPOT - Multi-Tenant Artifact Repository Platform
//!
//! Main entry point: load configuration from the environment, compose the
//! platform, start the background loops, and serve the HTTP surface.

use depot::api::{create_router, AppState};
use depot::config::DepotConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = DepotConfig::from_env()?;
    tracing::info!(
        version = depot::VERSION,
        listen = %config.listen_addr,
        storage = %config.storage.base_path.display(),
        data_shards = config.storage.data_shards,
        parity_shards = config.storage.parity_shards,
        "starting depot"
    );

    let state = AppState::build(config.clone())?;
    let _background = state.spawn_background_tasks();

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
