//! interp-rpc-daemon
//!
//! Execution-tier daemon that keeps one interactive interpreter per language
//! alive and serves `execute` requests from the web tier over a framed RPC
//! socket.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use interp_rpc_daemon::config::Config;
use interp_rpc_daemon::registry::InterpreterRegistry;
use interp_rpc_daemon::rpc::RpcGateway;

#[derive(Parser, Debug)]
#[command(name = "interp-rpc-daemon")]
#[command(about = "RPC execution tier for long-lived interactive interpreters")]
struct Args {
    /// Configuration file (JSON); INTERP_RPC_CONFIG or compiled presets
    /// apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, overriding the configured one
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging on stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    let listen = args.listen.unwrap_or(config.gateway.listen);

    let registry = Arc::new(InterpreterRegistry::new(config));
    info!(languages = ?registry.languages(), "Loaded configuration");

    let gateway = RpcGateway::bind(listen, Arc::clone(&registry)).await?;

    let outcome = tokio::select! {
        served = gateway.serve() => served,
        signal = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            signal.context("Failed to listen for shutdown signal")
        }
    };

    // Interpreters are killed before exit so none outlive the daemon.
    registry.shutdown().await;
    outcome
}
