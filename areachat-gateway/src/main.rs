//! `AreaChat` development gateway.
//!
//! Serves the area channel on `/ws` and the REST API under `/api` with
//! in-memory history, for running the client locally.
//!
//! ```bash
//! cargo run --bin areachat-gateway -- --config gateway.toml
//! AREACHAT_GATEWAY_ADDR=127.0.0.1:8080 cargo run --bin areachat-gateway
//! ```

use std::sync::Arc;

use areachat_gateway::config::{GatewayCliArgs, GatewayConfig};
use areachat_gateway::gateway::{self, GatewayState};
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = GatewayCliArgs::parse();

    let config = match GatewayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    if config.users.is_empty() {
        tracing::warn!("no [[users]] configured; every request will be refused");
    }
    tracing::info!(
        addr = %config.bind_addr,
        users = config.users.len(),
        areas = config.areas.len(),
        "starting areachat gateway"
    );

    let state = Arc::new(GatewayState::from_config(&config));

    match gateway::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "gateway listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "gateway task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start gateway");
            std::process::exit(1);
        }
    }
}
