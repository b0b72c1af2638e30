// Service entry point - one binary, one subcommand per service

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use soorma::cli::{self, Cli, Commands};
use soorma::config::Config;
use soorma::{gateway, memory, registry};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config introspection needs no tracing or server setup.
    if let Commands::Config { show, path } = cli.command {
        cli::handle_config(show, path);
        return Ok(());
    }

    let config = Config::from_env();

    // Precedence: RUST_LOG env var > config file level > "info"
    let default_filter = format!("soorma={},tower_http=info,axum=info", config.log_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    // One shutdown signal for whichever service runs in this process.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received Ctrl+C, shutting down");
            let _ = shutdown_tx.send(());
        }
    });

    match cli.command {
        Commands::Events => gateway::run(config.event_service, shutdown_rx).await,
        Commands::Registry => registry::run(config.registry, shutdown_rx).await,
        Commands::Memory => memory::run(config.memory, shutdown_rx).await,
        Commands::Config { .. } => unreachable!("handled above"),
    }
}
