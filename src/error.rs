// src/error.rs
use std::io;
use thiserror::Error;

// Re-export anyhow's Result type
pub use anyhow::Result;

/// Custom Error type for the metricsd library
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Collection error: {0}")]
    Collection(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for ingest operations
pub type IngestResult<T> = std::result::Result<T, IngestError>;

/// Reasons the server rejects an update or a query
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IngestError {
    /// Malformed payload or a record missing the value its kind requires
    #[error("wrong query: {0}")]
    WrongQuery(String),

    /// The record's hash does not match the configured key
    #[error("wrong hash for metric {0}")]
    WrongHash(String),

    /// The record's type is neither gauge nor counter
    #[error("wrong metrics type: {0}")]
    WrongMetricsType(String),

    #[error("no such metric: {0}")]
    NoSuchMetric(String),

    #[error("storage error: {0}")]
    StorageError(String),
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::WrongQuery(err.to_string())
    }
}
