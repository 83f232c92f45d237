use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

use metricsd::api;
use metricsd::config::{load_layered, LogLevel, ServerConfig};
use metricsd::service::IngestService;
use metricsd::storage;
use metricsd::util::logging;

/// Command line arguments for the server. Environment variables prefixed
/// with `METRICS_` take precedence over these.
#[derive(Parser, Serialize, Debug)]
#[command(name = "metricsd-server", version, about = "Receives, accumulates and serves metrics")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    #[serde(skip)]
    config: Option<PathBuf>,

    /// Listen address as host:port
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    address: Option<String>,

    /// Snapshot interval in seconds; 0 saves after every write
    #[arg(short = 'i', long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    store_interval: Option<u64>,

    /// Snapshot file; empty disables snapshots
    #[arg(short = 'f', long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    store_file: Option<String>,

    /// Load the snapshot file on startup
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    restore: Option<bool>,

    /// Signing key
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<String>,

    /// PostgreSQL connection string
    #[arg(short = 'd', long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    database_dsn: Option<String>,

    /// Logging level
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    log_level: Option<String>,
}

fn load(args: &Args) -> Result<ServerConfig> {
    load_layered(args.config.as_deref(), args)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match load(&args) {
        Ok(config) => config,
        Err(e) => {
            logging::init(&LogLevel::Error);
            error!("Failed to load configuration: {:#}", e);
            return Err(e);
        }
    };
    logging::init(&config.log_level);

    info!("Starting metricsd server v{}", metricsd::VERSION);

    let storage = storage::open(&config).await;
    let service = Arc::new(IngestService::new(Arc::clone(&storage), config.key()));

    let listener = TcpListener::bind(&config.address)
        .await
        .with_context(|| format!("Failed to bind {}", config.address))?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for interrupt signal: {}", e);
            return;
        }
        info!("Received interrupt signal, shutting down...");
    };

    let served = api::serve(listener, service, shutdown).await;

    if let Err(e) = storage.close().await {
        error!("Failed to close {} storage: {:#}", storage.name(), e);
    }

    served
}
