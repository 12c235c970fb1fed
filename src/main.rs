//! Bridge gateway
//!
//! A reverse proxy built on the bridge engine.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client ──▶ net::listener ──▶ TransportSession ──▶ AcceptProcessor
//!                                   (http#codec)            │
//!                                                           ▼
//!                                                     BindingTable
//!                                                           │
//!                                                           ▼
//!                                                     ProxyHandler
//!                                                           │
//!                                                           ▼
//!     Backend ◀── net::tcp ◀── pool / connector ◀── ConnectProcessor
//!
//!     101 Switching Protocols: both transports → PipeHandler pair
//!
//!     Cross-cutting: config (+ hot reload), observability, lifecycle, admin
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;

use bridge_gateway::config::{load_config, watcher::ConfigWatcher};
use bridge_gateway::gateway::Gateway;
use bridge_gateway::lifecycle::{wait_for_signal, SignalEvent};
use bridge_gateway::observability::{logging, metrics};
use bridge_gateway::admin;

#[derive(Parser)]
#[command(name = "bridge-gateway", version)]
#[command(about = "HTTP/1.x bridging reverse proxy", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, default_value = "gateway.toml")]
    config: PathBuf,

    /// Do not reload the configuration when the file changes
    #[arg(long)]
    no_watch: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    logging::init_logging(&config.observability);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "bridge-gateway starting");
    tracing::info!(
        path = %cli.config.display(),
        services = config.services.len(),
        workers = config.listener.workers,
        max_connections = config.listener.max_connections,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let admin_config = config.admin.clone();
    let gateway = Gateway::new(config);
    gateway.start().await?;
    for (authority, addr) in gateway.listener_addrs() {
        tracing::info!(authority = %authority, address = %addr, "Listening for connections");
    }

    if admin_config.enabled {
        let listener = TcpListener::bind(&admin_config.bind_address).await?;
        let gateway = gateway.clone();
        tokio::spawn(async move {
            if let Err(e) = admin::serve(gateway, listener).await {
                tracing::error!(error = %e, "Admin server failed");
            }
        });
    }

    let _watcher = if cli.no_watch {
        None
    } else {
        let (watcher, updates) = ConfigWatcher::new(&cli.config);
        let guard = watcher.run()?;
        tokio::spawn(gateway.clone().watch(updates));
        Some(guard)
    };

    loop {
        match wait_for_signal().await? {
            SignalEvent::Shutdown => break,
            SignalEvent::Reload => match load_config(&cli.config) {
                Ok(config) => {
                    if let Err(e) = gateway.apply(config).await {
                        tracing::error!(error = %e, "Reload failed");
                    }
                }
                Err(e) => tracing::error!(error = %e, "Reload failed, keeping current configuration"),
            },
        }
    }

    let drain = Duration::from_secs(gateway.config().listener.drain_timeout_secs);
    gateway.shutdown(drain).await;
    tracing::info!("Shutdown complete");
    Ok(())
}
