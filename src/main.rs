//! Tidemark - incremental change detection for test result series
//!
//! This is the main entry point for the `tm` binary.

use anyhow::Result;
use clap::Parser;
use tm_cli::Cli;
use tm_config::TmConfig;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config file; a broken config is reported by the command itself
    let config = match &cli.config {
        Some(path) => TmConfig::load_with_env(path),
        None => TmConfig::discover_with_env(),
    }
    .unwrap_or_default();

    let default_level = if cli.verbose {
        "debug".to_string()
    } else {
        config.global.log_level.clone()
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(filter);
    if config.global.json_logs {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }

    debug!(
        version = env!("CARGO_PKG_VERSION"),
        db = %config.global.db_path.display(),
        "Starting tm"
    );

    cli.run().await?;

    Ok(())
}
