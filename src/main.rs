use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod allowlist;
mod backend;
mod config;
mod deploy;
mod error;
mod gateway;
mod origin;
mod router;

use config::Config;
use gateway::GatewayFront;

#[derive(Parser, Debug)]
#[command(name = "edge-gateway")]
#[command(about = "Allow-listed edge gateway with path routing and origin adapters")]
struct Args {
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    #[arg(short, long)]
    validate_config: bool,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration; validation is fatal before anything starts.
    let config = Arc::new(Config::load(&args.config).await?);

    // Initialize tracing. RUST_LOG wins; otherwise the config's logging
    // section and the CLI verbose flag pick the default filter.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.filter_directive(args.verbose).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting edge gateway");

    if args.validate_config {
        info!("Configuration is valid");
        return Ok(());
    }

    // Backend sets register one by one; a gated set blocks only itself.
    let gateway = GatewayFront::from_config(config.clone()).await?;

    let host = config.server.host.clone();
    let port = config.server.port;
    let public_url = gateway.url();

    let server_task = {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            if let Err(e) = gateway.serve().await {
                error!("Server error: {}", e);
            }
        })
    };

    info!("Edge gateway started successfully");
    info!("Backend sets in service: {:?}", gateway.backends().names());
    info!("Listening on {}:{}, public URL {}", host, port, public_url);

    // Handle shutdown gracefully
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = server_task => {
            error!("Main server task exited unexpectedly");
        }
    }

    info!("Edge gateway shutdown complete");
    Ok(())
}
