//! src/main.rs
//!
//! Binary entry point. Responsible for initializing tracing, loading
//! configuration, starting the node, and shutting it down on Ctrl+C.

use anyhow::Context;
use repram::{App, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize the tracing subscriber.
    // RUST_LOG=info will be the default.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load configuration.
    let config = Config::load().context("Failed to load configuration")?;

    // Start the node and run until interrupted.
    let handle = match App::new(config)?.start().await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "💥 Node failed to start");
            std::process::exit(1);
        }
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    tracing::info!("Ctrl+C received. Initiating graceful shutdown...");
    handle.shutdown().await;

    Ok(())
}
