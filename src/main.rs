//! exchange-chain server binary.
//!
//! ```text
//! config (TOML) ─► ConnectionManager ─► ForwardDispatch (routes)
//!                        │                     │
//!                        ▼                     ▼
//!                 server_pipeline ─► HttpServer ─► Listener
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use exchange_chain::chain::dispatch::NoopUnitOfWork;
use exchange_chain::client::{ConnectionManager, ForwardDispatch};
use exchange_chain::config::{load_config, ServerConfig};
use exchange_chain::lifecycle::{spawn_signal_handler, Shutdown};
use exchange_chain::observability::{init_tracing, metrics};
use exchange_chain::server::{HttpServer, Listener};
use exchange_chain::server_pipeline;

#[derive(Parser)]
#[command(name = "exchange-chain")]
#[command(about = "HTTP exchange server with a protocol-stage chain", long_about = None)]
struct Args {
    /// TOML configuration file; defaults apply when absent.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listener bind address.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.listener.bind_address = bind;
    }

    init_tracing(&config.observability.log_level);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "exchange-chain starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        routes = config.routes.len(),
        cache = config.cache.enabled,
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

    let manager = Arc::new(ConnectionManager::new(&config));
    let forward = Arc::new(ForwardDispatch::new(&config.routes, manager.clone()));
    let pipeline = server_pipeline(&config, manager.clone(), Arc::new(NoopUnitOfWork), forward);

    let listener = Listener::bind(&config.listener).await?;
    let server = HttpServer::new(&config, pipeline);

    let shutdown = Arc::new(Shutdown::new());
    spawn_signal_handler(shutdown.clone());

    server.run(listener, &shutdown).await?;
    manager.shutdown();

    tracing::info!("Shutdown complete");
    Ok(())
}
