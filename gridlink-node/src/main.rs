use anyhow::Result;
use clap::Parser;
use gridlink_node::{GridNode, NodeConfig};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "gridlink-node", about = "Distributed key/value and topic data grid node")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the node identifier from the configuration
    #[arg(long)]
    identifier: Option<u8>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => NodeConfig::from_file(path)?,
        None => NodeConfig::default(),
    };
    if let Some(identifier) = args.identifier {
        config.node.identifier = identifier;
    }

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    info!(
        "Starting gridlink node v{} as host {}",
        env!("CARGO_PKG_VERSION"),
        config.node.identifier
    );

    let node = GridNode::new(config)?;
    let tasks = node.start().await?;

    for task in tasks {
        task.await?;
    }

    Ok(())
}
