//! Shogun Relay binary

use std::sync::Arc;
use shogun_api::{telemetry, AppState, Server, ServerConfig};
use shogun_core::RelayConfig;
use tracing::{error, info};

/// Resolves when the process receives SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received; draining");
}

#[tokio::main]
async fn main() {
    // Initialize structured logging (reads RUST_LOG and LOG_FORMAT env vars)
    telemetry::init();

    info!("Starting Shogun Relay");

    let config = match RelayConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!("❌ Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if config.admin_token.is_none() {
        info!("ℹ️ No ADMIN_TOKEN configured; admin surfaces are unreachable");
    }

    let state = match AppState::from_config(config.clone()).await {
        Ok(state) => Arc::new(state),
        Err(e) => {
            error!("❌ Failed to initialize relay: {}", e);
            std::process::exit(1);
        }
    };
    info!(
        "✅ Relay initialized (drive: {}, ipfs: {}, relay address: {})",
        config.drive_root,
        config.ipfs_api_url,
        state.keypair.address()
    );

    let scheduler = state.start_scheduler();

    let server_config = ServerConfig {
        host: config.host.clone(),
        port: config.port,
        enable_cors: config.enable_cors,
    };
    let server = Server::new(server_config, Arc::clone(&state));

    if let Err(e) = server.start(shutdown_signal()).await {
        error!("Server error: {}", e);
        scheduler.shutdown().await;
        std::process::exit(1);
    }

    scheduler.shutdown().await;
    info!("relay stopped cleanly");
}
