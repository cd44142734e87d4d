//! NetState - Replicated Network State Stores
//!
//! Runs one controller node of the replicated link and group stores.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use netstate::config::NetStateConfig;
use netstate::error::Result;
use netstate::node::{ControllerNode, LoggingDelegate};

/// NetState - Replicated Network State Stores
#[derive(Parser)]
#[command(name = "netstate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "netstate.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the controller node
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "netstate.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info {
        /// Print the effective configuration as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The configured level applies unless overridden on the command line
    let level = cli.log_level.clone().unwrap_or_else(|| {
        NetStateConfig::from_file(&cli.config)
            .map(|config| config.logging.level)
            .unwrap_or_else(|_| "info".to_string())
    });
    init_logging(&level);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Info { json } => run_info(cli.config, json),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Start the controller node
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting NetState node...");

    let config = match NetStateConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };
    tracing::info!("Loaded configuration for node: {}", config.node.id);

    let node = ControllerNode::new(config);
    node.link_store().set_delegate(LoggingDelegate::new("link"));
    node.group_store().set_delegate(LoggingDelegate::new("group"));

    if let Err(e) = node.start().await {
        tracing::error!("Failed to start node: {}", e);
        return Err(e);
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received shutdown signal"),
        Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
    }

    node.shutdown().await;
    tracing::info!("NetState shutdown complete");
    Ok(())
}

/// Initialize a new configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    std::fs::write(&output, NetStateConfig::sample(&node_id))?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to add peers and device mastership.");
    println!("Then start with: netstate start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match NetStateConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Bind Address: {}", config.node.bind_address);
            println!("  Peers: {}", config.cluster.peers.len());
            println!("  Mastership entries: {}", config.mastership.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf, json: bool) -> Result<()> {
    let config = NetStateConfig::from_file(&config_path)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    println!("NetState Node Information");
    println!("=========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Bind Address:     {}", config.node.bind_address);
    println!("Advertise:        {}", config.advertise_address());
    println!();
    println!("Cluster Configuration:");
    for peer in &config.cluster.peers {
        println!("  Peer:           {} at {}", peer.id, peer.address);
    }
    println!("  Workers:        {}", config.cluster.message_handler_threads);
    println!(
        "  Anti-entropy:   every {} s (first after {} s)",
        config.cluster.anti_entropy_period_secs, config.cluster.anti_entropy_initial_delay_secs
    );
    println!();
    println!("Mastership:");
    for entry in &config.mastership {
        println!("  {:<24} {} (term {})", entry.device, entry.master, entry.term);
    }
    println!();
    println!("Link Store:");
    println!("  Backend:        {:?}", config.link.backend);
    println!("  Discovery:      {:?}", config.link.discovery_mode);
    println!();
    println!("Group Store:");
    println!("  Garbage collect: {} (after {} audits)", config.group.garbage_collect, config.group.gc_thresh);
    println!("  Extraneous:      {}", config.group.allow_extraneous_groups);

    Ok(())
}
