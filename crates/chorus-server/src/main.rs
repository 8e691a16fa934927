//! # Chorus Server
//!
//! Real-time messaging and signaling hub.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! chorus
//!
//! # Run with custom config
//! chorus --config /path/to/chorus.toml
//!
//! # Override settings from the environment
//! CHORUS__PORT=8080 CHORUS__HOST=0.0.0.0 chorus
//!
//! # Show the effective configuration
//! chorus --print-config
//! ```

mod config;
mod handlers;
mod metrics;
mod session;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Command line arguments.
#[derive(Debug, Parser)]
#[command(name = "chorus", version, about = "Real-time messaging and signaling hub")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print the effective configuration and exit.
    #[arg(long)]
    print_config: bool,
}

fn init_tracing(config: &config::Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "chorus=debug,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    if config.is_production() {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = config::Config::load(args.config.as_deref())?;
    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    init_tracing(&config);
    tracing::info!(
        environment = %config.environment,
        "Starting Chorus server on {}:{}",
        config.host,
        config.port
    );

    // Initialize metrics
    if config.metrics.enabled {
        metrics::init_metrics();
    }

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
