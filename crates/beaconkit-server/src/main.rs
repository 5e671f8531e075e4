//! # beaconkit-server
//!
//! Runs the beacon event pipeline behind an HTTP API.
//!
//! ## Running
//!
//! ```bash
//! # Settings from /etc/beaconkit/config.toml (Linux) plus BEACONKIT_* variables
//! cargo run --package beaconkit-server
//!
//! # Explicit settings file
//! cargo run --package beaconkit-server -- ./config.toml
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use beaconkit_core::Settings;
use beaconkit_server::state::AppState;
use beaconkit_server::{api, logging};
use tokio::net::TcpListener;
use tracing::info;

/// Environment variable naming the settings file.
const CONFIG_PATH_ENV: &str = "BEACONKIT_CONFIG";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from));

    let settings = Settings::load(config_path.as_deref()).context("failed to load settings")?;
    logging::init(settings.server.production)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting beaconkit-server");

    let addr: SocketAddr = settings.server.bind_address.parse()?;
    let state = Arc::new(AppState::from_settings(settings).context("failed to load zone definitions")?);
    state.orchestrator.start()?;

    let app = api::create_router(Arc::clone(&state));
    let listener = TcpListener::bind(addr).await?;

    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    state.orchestrator.stop();
    Ok(())
}
