//! Binary entrypoint: load config, wire the backend/hub pair into shared
//! state, and run the WebSocket listener, health listener, and expiry
//! sweeper side by side until shutdown.

use anon_relay::config::Config;
use anon_relay::state::AppState;
use anon_relay::{health, sweeper, transport};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    let ws_addr: std::net::SocketAddr = ([0, 0, 0, 0], config.port).into();
    let health_addr: std::net::SocketAddr = ([0, 0, 0, 0], config.port + 1).into();
    let backend_kind = if config.redis_url.is_some() { "redis" } else { "local" };

    tracing::info!(backend = backend_kind, port = config.port, "starting anon-relay-server");

    let state = AppState::new(config).await?;

    let sweeper_state = state.clone();
    tokio::spawn(sweeper::run(sweeper_state));

    let health_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = health::run(health_state, health_addr).await {
            tracing::error!(error = %e, "health listener exited");
        }
    });

    transport::run(state, ws_addr).await
}
