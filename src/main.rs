//! gatehouse: a readiness-driven TCP server with admission control
//!
//! A single event loop multiplexes the listening socket and every admitted
//! client connection. Three behaviors hang off the loop:
//! - Admission: peers whose address is not on the allow list are refused
//!   after accept, before they can exchange further data
//! - Echo: every data-ready client gets a fixed acknowledgment
//! - Join broadcast: each admission is announced over a UDP datagram
//!
//! Configuration via CLI arguments or TOML file.

mod admission;
mod broadcast;
mod config;
mod connection;
mod server;

use config::Config;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        allow = %config.allow,
        broadcast = %config.broadcast_host,
        broadcast_port = config.broadcast_port,
        max_connections = config.max_connections,
        "Starting gatehouse server"
    );

    let mut server = Server::bind(&config)?;
    server.run()?;
    Ok(())
}
