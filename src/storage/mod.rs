//! Server-side metric storage backends
use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::error::Result;

pub mod memory;
pub mod postgres;

pub use memory::{MemoryStorage, SnapshotConfig};
pub use postgres::PostgresStorage;

/// Generic trait for storage backends
///
/// Counters and gauges live in separate namespaces, so the same name may
/// exist as both kinds.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Current value of a counter, if known
    async fn get_counter(&self, name: &str) -> Result<Option<i64>>;

    /// Overwrite a counter
    async fn set_counter(&self, name: &str, value: i64) -> Result<()>;

    /// Add `delta` to a counter in one step, treating an absent counter as
    /// zero. Returns the new value.
    async fn add_counter(&self, name: &str, delta: i64) -> Result<i64>;

    /// Current value of a gauge, if known
    async fn get_gauge(&self, name: &str) -> Result<Option<f64>>;

    /// Overwrite a gauge
    async fn set_gauge(&self, name: &str, value: f64) -> Result<()>;

    /// Names of every stored metric. A name stored as both kinds may appear twice.
    async fn list_names(&self) -> Result<Vec<String>>;

    /// Check the backend health
    async fn health_check(&self) -> Result<bool>;

    /// Persist outstanding state and stop background work
    async fn close(&self) -> Result<()>;

    /// Get a name for this storage backend
    fn name(&self) -> &str;
}

/// Open the backend selected by `config`.
///
/// A configured database DSN selects PostgreSQL; if that backend cannot be
/// constructed the server carries on with in-memory storage.
pub async fn open(config: &ServerConfig) -> Arc<dyn Storage> {
    if let Some(dsn) = config.database_dsn() {
        match PostgresStorage::connect(dsn).await {
            Ok(storage) => {
                info!("Using PostgreSQL storage");
                return Arc::new(storage);
            }
            Err(e) => {
                warn!("PostgreSQL storage unavailable, falling back to memory: {:#}", e);
            }
        }
    }

    let snapshot = SnapshotConfig {
        path: config.store_file(),
        interval: config.store_interval(),
        restore: config.restore,
    };
    info!(
        "Using in-memory storage (snapshot: {})",
        snapshot
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "none".to_string())
    );

    MemoryStorage::open(snapshot).await
}
