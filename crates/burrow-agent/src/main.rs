//! Burrow agent CLI
//!
//! Runs behind NAT, dials out to a hub, and forwards tunnelled requests to
//! local targets.

use anyhow::{Context, Result};
use burrow_agent::{Agent, AgentConfig};
use burrow_transport_websocket::TlsVerify;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Burrow agent - connects local services to a public hub
#[derive(Parser, Debug)]
#[command(name = "burrow-agent")]
#[command(about = "Burrow agent - exposes local HTTP services through a hub")]
#[command(version)]
struct Args {
    /// Hub control URL, e.g. ws://hub.example.com:8081/api/v1/hubs/myid
    #[arg(long, env = "BURROW_HUB_URL")]
    hub_url: String,

    /// Skip TLS certificate verification (development only)
    #[arg(long)]
    insecure: bool,

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

    info!("Burrow agent starting...");

    let tls_verify = if args.insecure {
        TlsVerify::Skip
    } else {
        TlsVerify::Strict
    };
    let agent = Agent::new(AgentConfig {
        connect_url: args.hub_url,
        tls_verify,
    });

    tokio::select! {
        result = agent.run() => result.context("Agent session terminated with an error"),
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}
