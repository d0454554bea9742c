//! Emberlink broker daemon
//!
//! Usage:
//!   emberlink [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path (TOML)
//!   -b, --bind <ADDR>      TCP bind address (default: 0.0.0.0:1883)
//!   -l, --log-level <LVL>  Log level (error, warn, info, debug, trace)

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use emberlink::broker::Broker;
use emberlink::config::Config;
use emberlink::hooks::events::DeviceEventsHook;
use emberlink::listener::TcpListener;

/// Emberlink - MQTT v3.1.1/v5.0 broker
#[derive(Parser, Debug)]
#[command(name = "emberlink", version, about)]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };

    let level = args.log_level.as_deref().unwrap_or(&config.log.level);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    let bind = args.bind.unwrap_or(config.server.bind);
    let broker = Broker::new(config.to_options());

    let device_events = Arc::new(DeviceEventsHook::new(config.server.node_name.clone()));
    device_events.attach(&broker);
    broker.add_hook(device_events);

    broker.add_listener(Arc::new(TcpListener::bind("tcp", bind).await?));
    broker.serve().await;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    broker.close().await;

    Ok(())
}
