use anyhow::Result;
use clap::Parser;
use log::{error, info};
use serde::Serialize;
use std::path::PathBuf;

use metricsd::agent::{self, AgentPipeline, PipelineConfig};
use metricsd::config::{load_layered, LogLevel, AgentConfig};
use metricsd::sampler::SystemSampler;
use metricsd::transport::HttpTransport;
use metricsd::util::logging;

/// Command line arguments for the agent. Environment variables prefixed
/// with `METRICS_` take precedence over these.
#[derive(Parser, Serialize, Debug)]
#[command(name = "metricsd-agent", version, about = "Samples host metrics and pushes them to a metricsd server")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    #[serde(skip)]
    config: Option<PathBuf>,

    /// Server address as host:port
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    address: Option<String>,

    /// Sampling interval in seconds
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    poll_interval: Option<u64>,

    /// Publishing interval in seconds
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    report_interval: Option<u64>,

    /// Signing key
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<String>,

    /// Logging level
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    log_level: Option<String>,
}

fn load(args: &Args) -> Result<AgentConfig> {
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

    info!("Starting metricsd agent v{}", metricsd::VERSION);
    info!("Reporting to {}", config.address);

    let transport = HttpTransport::batch(&config.address)?;
    let pipeline = AgentPipeline::new(PipelineConfig::from(&config), SystemSampler::new(), transport);
    let handles = pipeline.start()?;

    tokio::signal::ctrl_c().await?;
    info!("Received interrupt signal, shutting down...");
    agent::shutdown(handles);

    Ok(())
}
