//! `sparx` server binary.
//!
//! Serves the reference echo handler:
//!
//! ```text
//! sparx --config sparx.toml --port 8080
//! SPARX_LOG=debug sparx
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use sparx::config::{load_config, ServerConfig};
use sparx::observability::{logging, metrics};

#[derive(Debug, Parser)]
#[command(name = "sparx", version, about = "Demand-driven HTTP/WebSocket streaming server")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the bind host
    #[arg(long)]
    host: Option<String>,

    /// Override the bind port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "sparx starting");

    if config.observability.metrics_enabled {
        let addr: SocketAddr = config.observability.metrics_address.parse()?;
        metrics::init_metrics(addr)?;
    }

    tracing::info!(
        bind_address = %config.bind_address(),
        max_connections = config.max_connections,
        workers = config.workers,
        "Configuration loaded"
    );

    let server = sparx::start(config, sparx::echo::echo).await?;
    tracing::info!(address = %server.local_addr(), "Listening for connections");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl+C, shutting down");

    let report = sparx::stop(&server).await;
    tracing::info!(
        drained = report.drained,
        rejected_queued = report.rejected_queued,
        "Shutdown complete"
    );
    Ok(())
}
