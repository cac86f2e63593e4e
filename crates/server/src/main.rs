//! usbip-bridge Server
//!
//! Exports USB devices of this host to remote USB/IP clients.

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use server::config::{self, ServerConfig};
use server::device::DeviceProvider;
use server::network;
use server::usb::HostEnumerator;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usbip-bridge-server")]
#[command(author, version, about = "USB/IP server - export USB devices over TCP")]
#[command(long_about = "
Exports USB devices attached to this host over TCP using the USB/IP protocol.
Remote Linux hosts attach them with the kernel USB/IP client:

    usbip list -r <server>
    usbip attach -r <server> -b <bus-id>

EXAMPLES:
    # Run with default config
    usbip-bridge-server

    # Run with custom config
    usbip-bridge-server --config /path/to/config.toml

    # List USB devices without starting server
    usbip-bridge-server --list-devices

    # Listen on a specific address with debug logging
    usbip-bridge-server --bind 127.0.0.1:3240 --log-level debug

CONFIGURATION:
    The server looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbip-bridge/server.toml
    3. /etc/usbip-bridge/server.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Listen address, overrides server.bind_addr
    #[arg(short, long, value_name = "ADDR")]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = ServerConfig::default();
        let path = ServerConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        config::load_config(path).context("Failed to load configuration")?
    } else {
        ServerConfig::load_or_default()
    };
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }
    if let Some(level) = args.log_level {
        config.server.log_level = level;
    }
    config.validate().context("Invalid configuration")?;

    setup_logging(&config.server.log_level).context("Failed to setup logging")?;

    info!("usbip-bridge Server v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", config.server.log_level);

    let enumerator =
        HostEnumerator::new(config.usb.filters.clone()).context("Failed to initialize libusb")?;

    if args.list_devices {
        return list_devices_mode(&enumerator);
    }

    run_server(&config, &enumerator).await
}

/// List USB devices and exit
fn list_devices_mode(enumerator: &HostEnumerator) -> Result<()> {
    let devices = enumerator.list().context("Failed to enumerate USB devices")?;

    if devices.is_empty() {
        println!("No USB devices found.");
    } else {
        println!("Found {} USB device(s):\n", devices.len());
        for device in devices {
            println!("  {}", device);
        }
    }
    Ok(())
}

async fn run_server(config: &ServerConfig, enumerator: &HostEnumerator) -> Result<()> {
    let provider = DeviceProvider::new();
    let registered = enumerator
        .register_all(&provider)
        .context("Failed to enumerate USB devices")?;
    if registered == 0 {
        warn!("No USB devices match the configured filters");
    } else {
        info!("Exporting {}", provider.bus_ids().join(", "));
    }

    let (reactor, reactor_thread) = network::spawn(config.reactor_config()?, provider)
        .context("Failed to start reactor")?;

    let addr = reactor.link_up().await.context("Failed to bind listener")?;
    info!("Listening on {}", addr);
    info!("Press Ctrl+C to shutdown");

    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
        Err(e) => error!("Error waiting for Ctrl+C: {}", e),
    }

    if let Ok(stats) = reactor.stats().await {
        info!(
            "Served {} connections ({} rejected, {} idle, {} errors)",
            stats.accepted, stats.rejected, stats.closed_idle, stats.closed_error
        );
    }
    if let Err(e) = reactor.link_down().await {
        error!("Error during link down: {}", e);
    }
    reactor.shutdown().context("Failed to stop reactor")?;

    if reactor_thread.join().is_err() {
        error!("Reactor thread panicked");
    }

    info!("Server shutdown complete");
    Ok(())
}
