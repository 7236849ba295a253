//! # Comet Server
//!
//! Message-delivery node of a push cluster.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! comet
//!
//! # Run with custom config
//! comet --config /path/to/comet.toml
//!
//! # Run with environment variables
//! COMET_NODE=node2 COMET_ADMIN_ADDR=0.0.0.0:8070 comet
//! ```

mod config;
mod handlers;
mod metrics;
mod rpc;

use anyhow::{bail, Result};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "comet=info,comet_server=info,comet_core=info,comet_transport=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match config_path(std::env::args().skip(1))? {
        Some(path) => config::Config::from_file(path)?,
        None => config::Config::load()?,
    };
    config.validate()?;

    tracing::info!(
        node = %config.node,
        rpc = %config.rpc.admin_addr,
        "Starting Comet node"
    );

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}

/// Extract `--config <path>` from the command line.
fn config_path(mut args: impl Iterator<Item = String>) -> Result<Option<PathBuf>> {
    let mut path = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => match args.next() {
                Some(value) => path = Some(PathBuf::from(value)),
                None => bail!("--config requires a path"),
            },
            other => match other.strip_prefix("--config=") {
                Some(value) => path = Some(PathBuf::from(value)),
                None => bail!("Unknown argument: {}", other),
            },
        }
    }
    Ok(path)
}
