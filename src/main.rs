//! Multi-channel WebSocket Chat Relay - Entry Point
//!
//! Loads the configuration, creates the registry and accepts connections.

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chat_relay::{serve, Registry, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=chat_relay=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chat_relay=info")),
        )
        .init();

    // Flags and CHAT_* variables; clap exits with usage on bad values
    let config = ServerConfig::parse();

    let listener = TcpListener::bind(&config.addr).await?;
    info!("WebSocket Chat Relay listening on {}", config.addr);

    let registry = Registry::new(config);

    // The welcome channel lives for the whole process
    registry.welcome_channel().await?;
    info!("Welcome channel #{} ready", registry.config().welcome_channel);

    serve(listener, registry).await;

    Ok(())
}
