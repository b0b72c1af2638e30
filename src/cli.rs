// CLI module - command-line argument parsing and handlers
//
// One binary, one subcommand per service:
// - events:   the Event Service (HTTP + SSE gateway over the bus)
// - registry: the Registry Service (discovery + TTL liveness)
// - memory:   the Memory Service (tenant-scoped state)
// - config:   configuration introspection

use clap::{Parser, Subcommand};

use crate::config::{Config, VERSION};

/// Soorma - distributed-agent orchestration platform services
#[derive(Parser)]
#[command(name = "soorma")]
#[command(version = VERSION)]
#[command(about = "Distributed-agent orchestration platform services", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the Event Service (publish endpoint + SSE streams)
    Events,
    /// Run the Registry Service (event/agent discovery, TTL reaper)
    Registry,
    /// Run the Memory Service (working/episodic/semantic/procedural + plans/tasks)
    Memory,
    /// Inspect configuration
    Config {
        /// Show effective configuration (env > file > defaults)
        #[arg(long)]
        show: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,
    },
}

/// Handle the `config` subcommand.
pub fn handle_config(show: bool, path: bool) {
    if path {
        match Config::config_path() {
            Some(p) => println!("{}", p.display()),
            None => {
                eprintln!("Error: could not determine config path");
                std::process::exit(1);
            }
        }
        return;
    }

    if show {
        let config = Config::from_env();

        println!("# Effective configuration (env > file > defaults)");
        println!();
        println!("log_level = {:?}", config.log_level);
        println!();
        println!("[event_service]");
        println!("adapter = {:?}", config.event_service.adapter);
        println!("nats_url = {:?}", config.event_service.nats_url);
        println!("port = {}", config.event_service.port);
        println!(
            "stream_max_queue_size = {}",
            config.event_service.stream_max_queue_size
        );
        println!(
            "stream_heartbeat_interval_s = {}",
            config.event_service.stream_heartbeat_interval_s
        );
        println!();
        println!("[registry]");
        println!("database_url = {:?}", config.registry.database_url);
        println!("port = {}", config.registry.port);
        println!("agent_ttl_seconds = {}", config.registry.agent_ttl_seconds);
        println!(
            "agent_cleanup_interval_seconds = {}",
            config.registry.agent_cleanup_interval_seconds
        );
        println!("cors_origins = {:?}", config.registry.cors_origins);
        println!();
        println!("[memory]");
        println!("database_url = {:?}", config.memory.database_url);
        println!("port = {}", config.memory.port);
        println!(
            "embedding_model_dim = {}",
            config.memory.embedding_model_dim
        );

        println!();
        if let Some(p) = Config::config_path() {
            if p.exists() {
                println!("# Source: {}", p.display());
            } else {
                println!("# Source: defaults (no config file)");
            }
        }
        return;
    }

    println!("Usage: soorma config [--show|--path]");
    println!();
    println!("Options:");
    println!("  --show    Display effective configuration");
    println!("  --path    Show config file path");
}
