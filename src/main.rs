//! Hotwire reverse proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!   configuration store ──watch──▶ feed ──ChangeEvent──▶ supervisor
//!                                                          │ apply
//!                                                          ▼
//!     Client Request      ┌─────────┐    ┌─────────┐    ┌──────────┐    ┌────────────┐
//!     ───────────────────▶│   net   │───▶│  http   │───▶│ routing  │───▶│ middleware │
//!                         │listener │    │ server  │    │  trie    │    │   chain    │
//!                         └─────────┘    └─────────┘    └──────────┘    └─────┬──────┘
//!                                                                             ▼
//!     Client Response     ┌─────────┐                                  ┌──────────────┐
//!     ◀───────────────────│response │◀─────────────────────────────────│load_balancer │◀── Backend
//!                         └─────────┘                                  └──────────────┘
//! ```
//!
//! Routes, backends and limits live in the store under a key prefix. The
//! binary runs against the in-memory store, optionally seeded from a JSON
//! file.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use hotwire::config::loader::{load_config, load_seed};
use hotwire::feed::ChangeFeed;
use hotwire::lifecycle::{signals, Shutdown};
use hotwire::middleware::MiddlewareRegistry;
use hotwire::observability::{logging, metrics};
use hotwire::proxy::ProxyServer;
use hotwire::store::MemoryStore;
use hotwire::supervisor::{ServerFactory, Supervisor};
use hotwire::ProxyConfig;

#[derive(Debug, Parser)]
#[command(name = "hotwire", version, about = "Reverse proxy driven by a live configuration store")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured log level.
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }
    if cli.json {
        config.observability.log_format = "json".to_string();
    }

    logging::init(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "hotwire starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let store = Arc::new(MemoryStore::new());
    if let Some(path) = &config.store.seed_file {
        let seed = load_seed(path)?;
        let written = store.seed(&config.store.prefix, &seed)?;
        tracing::info!(path = %path.display(), keys = written, "Store seeded");
    }

    let feed = Arc::new(ChangeFeed::new(store.clone(), config.store.prefix.clone()));
    let registry = Arc::new(MiddlewareRegistry::with_defaults());
    let server_options = config.server_options();
    let factory: ServerFactory = Arc::new(move |id| {
        ProxyServer::new(id, Arc::clone(&registry), server_options.clone())
    });
    let supervisor = Supervisor::new(feed, factory, config.supervisor_options());
    supervisor.start().await?;
    tracing::info!(
        prefix = %config.store.prefix,
        listener = %config.listener.bind_address,
        "Proxy running"
    );

    let shutdown = Shutdown::new();
    let signal_task = signals::spawn_signal_handler(shutdown.clone());

    let fatal = tokio::select! {
        _ = shutdown.triggered() => None,
        result = supervisor.stopped() => result.err(),
    };

    if let Some(e) = fatal {
        tracing::error!(error = %e, "Supervisor failed");
        supervisor.stop(false).await;
        signal_task.abort();
        return Err(e.into());
    }

    tokio::select! {
        _ = supervisor.stop(true) => {}
        _ = shutdown.forced() => {
            tracing::warn!("Forced shutdown");
        }
    }
    signal_task.abort();
    tracing::info!("Shutdown complete");
    Ok(())
}
