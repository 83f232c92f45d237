//! The agent's sample/publish pipeline
//!
//! Three periodic tasks share one [`SharedMetrics`]: two sampling tasks that
//! check out a working copy, fill it on a blocking thread and check it back
//! in, and a publisher that snapshots the set, signs one record per metric
//! and hands the serialized batch to a [`Transport`].

mod report;

pub use report::build_batch;

use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::auth::Authenticator;
use crate::buffer::{Checkout, SharedMetrics};
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::sampler::Sampler;
use crate::transport::Transport;

/// Timing and signing settings for a pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// How often both samplers run
    pub poll_interval: Duration,
    /// How often a batch is published
    pub report_interval: Duration,
    /// Signing key, if any
    pub key: Option<String>,
}

impl From<&AgentConfig> for PipelineConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            report_interval: config.report_interval(),
            key: config.key().map(str::to_string),
        }
    }
}

/// Owns the shared metric set and the tasks that sample and publish it
pub struct AgentPipeline<S: Sampler, T: Transport> {
    config: PipelineConfig,
    metrics: Arc<SharedMetrics>,
    sampler: Arc<S>,
    transport: Arc<T>,
    authenticator: Arc<Authenticator>,
}

impl<S: Sampler, T: Transport> AgentPipeline<S, T> {
    /// Create a new pipeline
    pub fn new(config: PipelineConfig, sampler: S, transport: T) -> Self {
        let authenticator = Authenticator::new(config.key.as_deref());
        Self {
            config,
            metrics: Arc::new(SharedMetrics::new()),
            sampler: Arc::new(sampler),
            transport: Arc::new(transport),
            authenticator: Arc::new(authenticator),
        }
    }

    /// The shared metric set
    pub fn metrics(&self) -> Arc<SharedMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Seed an empty metric set and launch the runtime sampler, the
    /// additional sampler and the publisher.
    ///
    /// The tasks run until their handles are aborted.
    pub fn start(&self) -> Result<Vec<JoinHandle<()>>> {
        if self.config.poll_interval.is_zero() || self.config.report_interval.is_zero() {
            return Err(AgentError::Config("intervals must be greater than zero".to_string()).into());
        }

        self.metrics.with_lock(|m| *m = Default::default())?;

        info!(
            "Starting agent pipeline (poll: {:?}, report: {:?}, signing: {})",
            self.config.poll_interval,
            self.config.report_interval,
            self.authenticator.is_enabled()
        );

        Ok(vec![
            self.spawn_runtime_sampler(),
            self.spawn_additional_sampler(),
            self.spawn_publisher(),
        ])
    }

    fn spawn_runtime_sampler(&self) -> JoinHandle<()> {
        let metrics = Arc::clone(&self.metrics);
        let sampler = Arc::clone(&self.sampler);
        let period = self.config.poll_interval;

        tokio::spawn(async move {
            let mut ticker = new_ticker(period);
            loop {
                ticker.tick().await;
                debug!("Runtime sample started");

                let sampler = Arc::clone(&sampler);
                let result = sample_into(&metrics, move |checkout| {
                    sampler.sample_runtime(checkout);
                    Ok(())
                })
                .await;

                if let Err(e) = result {
                    error!("Runtime sample failed: {:#}", e);
                }
            }
        })
    }

    fn spawn_additional_sampler(&self) -> JoinHandle<()> {
        let metrics = Arc::clone(&self.metrics);
        let sampler = Arc::clone(&self.sampler);
        let period = self.config.poll_interval;

        tokio::spawn(async move {
            let mut ticker = new_ticker(period);
            loop {
                ticker.tick().await;
                debug!("Additional sample started");

                let sampler = Arc::clone(&sampler);
                let result =
                    sample_into(&metrics, move |checkout| sampler.sample_additional(checkout)).await;

                if let Err(e) = result {
                    error!("Additional sample failed: {:#}", e);
                }
            }
        })
    }

    fn spawn_publisher(&self) -> JoinHandle<()> {
        let metrics = Arc::clone(&self.metrics);
        let transport = Arc::clone(&self.transport);
        let authenticator = Arc::clone(&self.authenticator);
        let period = self.config.report_interval;

        tokio::spawn(async move {
            let mut ticker = new_ticker(period);
            loop {
                ticker.tick().await;

                if let Err(e) = publish(&metrics, &authenticator, transport.as_ref()).await {
                    warn!("Batch dropped: {:#}", e);
                }
            }
        })
    }
}

/// Abort every task returned by [`AgentPipeline::start`]
pub fn shutdown(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        handle.abort();
    }
    info!("Agent pipeline stopped");
}

/// Publish one batch built from the current state of `metrics`
pub async fn publish<T: Transport + ?Sized>(
    metrics: &SharedMetrics,
    authenticator: &Authenticator,
    transport: &T,
) -> Result<()> {
    let snapshot = metrics.snapshot()?;
    let batch = build_batch(&snapshot, authenticator);
    let payload = serde_json::to_vec(&batch).map_err(AgentError::from)?;

    transport.send(payload).await?;
    debug!("Sent {} metrics via {}", batch.len(), transport.name());
    Ok(())
}

/// Check out a working copy, run `sample` on it on a blocking thread and
/// check the result back in.
///
/// The checkout is checked in even when `sample` fails; a sampler that fails
/// leaves its copy unchanged, so nothing is merged.
async fn sample_into<F>(metrics: &SharedMetrics, sample: F) -> Result<()>
where
    F: FnOnce(&mut Checkout) -> Result<()> + Send + 'static,
{
    let mut checkout = metrics.checkout()?;

    let (checkout, outcome) = tokio::task::spawn_blocking(move || {
        let outcome = sample(&mut checkout);
        (checkout, outcome)
    })
    .await
    .map_err(|e| AgentError::Collection(format!("Sampling task panicked: {}", e)))?;

    metrics.checkin(checkout)?;
    outcome
}

// First tick fires one period after start
fn new_ticker(period: Duration) -> time::Interval {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
