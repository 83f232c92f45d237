//! A minimal metrics pipeline: an agent that samples, signs and pushes
//! metrics, and a server that validates, accumulates and stores them

pub mod agent;
pub mod api;
pub mod auth;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod sampler;
pub mod service;
pub mod storage;
pub mod transport;
pub mod util;

/// Re-export of commonly used types for convenience
pub mod prelude {
    pub use crate::agent::{AgentPipeline, PipelineConfig};
    pub use crate::auth::Authenticator;
    pub use crate::buffer::SharedMetrics;
    pub use crate::error::{AgentError, IngestError, IngestResult, Result};
    pub use crate::metrics::{MetricKind, MetricRecord, MetricSet};
    pub use crate::sampler::{Sampler, SystemSampler};
    pub use crate::service::IngestService;
    pub use crate::storage::Storage;
    pub use crate::transport::{HttpTransport, Transport};
}

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
