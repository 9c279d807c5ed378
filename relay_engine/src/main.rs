//! Relay entry point.
//!
//! Loads the JSON configuration, sets up logging and runs the configured
//! mode until interrupted.

mod assemble;
mod dispatch;

use clap::Parser;
use relay_utils::config::{Config, DEFAULT_CONFIG_PATH};
use relay_utils::logging;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Command-line arguments for the relay
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to the JSON configuration file
    #[clap(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("load config failed: {}", err);
            return Ok(());
        }
    };

    let _guard = match logging::init_logging_from_config(&config) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("logging setup failed: {}", err);
            return Ok(());
        }
    };
    info!(config = %args.config.display(), mode = %config.mode, "Configuration loaded");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                signal.cancel();
            }
            Err(err) => error!("Cannot listen for interrupts: {}", err),
        }
    });

    match dispatch::dispatch(&config, shutdown).await {
        Ok(outcome) => info!(?outcome, "Dispatch finished"),
        Err(err) => error!("{}", err),
    }

    info!("server stopped");
    Ok(())
}
