//! Burrow hub CLI
//!
//! Runs the public broker: agents dial in on the control endpoint, external
//! clients reach them through the proxy endpoint.

use anyhow::{Context, Result};
use burrow_hub::{serve, AppState, HubConfig};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Burrow hub - public broker for reverse tunnels
#[derive(Parser, Debug)]
#[command(name = "burrow-hub")]
#[command(about = "Burrow hub - routes external HTTP requests to agents behind NAT")]
#[command(version)]
struct Args {
    /// Address to bind the HTTP listener
    #[arg(long, env = "BURROW_HUB_BIND", default_value = "0.0.0.0:8081")]
    bind: SocketAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level)?;

    info!("Burrow hub starting...");

    let config = HubConfig { bind_addr: args.bind };
    let state = Arc::new(AppState::new());

    serve(&config, state)
        .await
        .context("Hub server terminated with an error")
}
