//! Litebase - Clustered SQLite with point-in-time restore

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use litebase::config::LitebaseConfig;
use litebase::LitebaseNode;

/// Litebase - Clustered SQLite with point-in-time restore
#[derive(Parser)]
#[command(name = "litebase")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "litebase.toml")]
    config: PathBuf,

    /// Log level, overrides the configured one (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "litebase.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => run_start(cli.config, cli.log_level).await,
        Commands::Init { output, node_id } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_init(output, node_id)
        }
        Commands::Validate => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_validate(cli.config)
        }
    }
}

/// Initialize logging; `RUST_LOG` wins over `level`
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the node and run until interrupted
async fn run_start(config_path: PathBuf, log_level: Option<String>) -> anyhow::Result<()> {
    let config = LitebaseConfig::from_file(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;

    init_logging(
        log_level.as_deref().unwrap_or(&config.logging.level),
        &config.logging.format,
    );
    tracing::info!("Loaded configuration for node: {}", config.node.id);

    let node = LitebaseNode::bind(config)
        .await
        .context("failed to start node")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    node.shutdown().await.context("shutdown failed")?;
    tracing::info!("Litebase shutdown complete");
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: String) -> anyhow::Result<()> {
    let shared_key = uuid::Uuid::new_v4().simple().to_string();
    let config_content = format!(
        r#"# Litebase Configuration

[node]
id = "{node_id}"
bind_address = "0.0.0.0:8080"
data_dir = "/var/lib/litebase/{node_id}"
# advertise_address = "my-public-ip:8080"

[cluster]
# Every node of a cluster must use the same key
shared_key = "{shared_key}"
peers = []
# peers = ["node-2.example.com:8080", "node-3.example.com:8080"]
heartbeat_interval_ms = 500
heartbeat_timeout_ms = 2000
election_window_ms = 3000

[api]
allowed_hosts = []
route_timeout_ms = 30000
cors_enabled = false

[storage]
compression = true
# object_dir = "/var/lib/litebase/objects"

[snapshots]
compaction_interval_secs = 86400

# [[auth.tokens]]
# token = "change-me"
# actions = ["*"]

[logging]
level = "info"
format = "pretty"
"#
    );

    std::fs::write(&output, config_content)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Configuration file created: {}", output.display());
    println!("Then start with: litebase start --config {}", output.display());
    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    let config = LitebaseConfig::from_file(&config_path)?;
    config.validate()?;

    println!("✓ Configuration is valid");
    println!("  Node ID: {}", config.node.id);
    println!("  Bind Address: {}", config.node.bind_address);
    println!("  Advertise: {}", config.advertise_address());
    println!("  Data Directory: {}", config.data_dir().display());
    println!("  Peers: {}", config.cluster.peers.len());
    println!("  Auth tokens: {}", config.auth.tokens.len());
    Ok(())
}
