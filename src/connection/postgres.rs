use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use std::future::Future;
use std::time::Duration;
use tokio_postgres::config::SslMode;
use tokio_postgres::types::ToSql;

use crate::error::AgentError;

/// Upper bound for every statement
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for the liveness probe
pub const PING_TIMEOUT: Duration = Duration::from_secs(1);

/// PostgreSQL connection provider
pub struct PostgresProvider {
    name: String,
    pool: deadpool_postgres::Pool,
}

impl PostgresProvider {
    /// Create a provider from a connection string and verify it can reach
    /// the database
    pub async fn connect(dsn: &str, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        debug!("Creating PostgreSQL provider: {}", &name);

        let pg_config: tokio_postgres::Config =
            dsn.parse().context("Invalid database connection string")?;
        let pool = Self::create_pool(pg_config)?;

        let provider = Self { name, pool };

        // Test basic query
        provider
            .execute("SELECT 1", &[])
            .await
            .context("Failed to execute test query")?;

        info!("Successfully connected to PostgreSQL database");
        Ok(provider)
    }

    /// Create a connection pool
    fn create_pool(pg_config: tokio_postgres::Config) -> Result<deadpool_postgres::Pool> {
        // Create the pool builder based on SSL mode
        let builder = match pg_config.get_ssl_mode() {
            SslMode::Disable => {
                debug!("Creating PostgreSQL pool with SSL disabled");
                let manager = deadpool_postgres::Manager::new(pg_config, tokio_postgres::NoTls);
                deadpool_postgres::Pool::builder(manager)
            }
            mode => {
                debug!("Creating PostgreSQL pool with SSL enabled (mode: {:?})", mode);
                let connector = build_tls_connector(mode)?;
                let tls = MakeTlsConnector::new(connector);
                let manager = deadpool_postgres::Manager::new(pg_config, tls);
                deadpool_postgres::Pool::builder(manager)
            }
        };

        builder
            .max_size(10)
            .build()
            .context("Failed to create connection pool")
    }

    /// Get a client from the pool
    pub async fn get_client(&self) -> Result<deadpool_postgres::Client> {
        bounded(QUERY_TIMEOUT, self.pool.get())
            .await?
            .context("Failed to get client from pool")
    }

    /// Execute a statement, returning the number of rows affected
    pub async fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        let client = self.get_client().await?;
        bounded(QUERY_TIMEOUT, client.execute(sql, params))
            .await?
            .context("Query execution error")
    }

    /// Execute a query and get rows
    pub async fn query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<tokio_postgres::Row>> {
        let client = self.get_client().await?;
        bounded(QUERY_TIMEOUT, client.query(sql, params))
            .await?
            .context("Query error")
    }

    /// Query for a single row
    pub async fn query_one(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<tokio_postgres::Row> {
        let client = self.get_client().await?;
        bounded(QUERY_TIMEOUT, client.query_one(sql, params))
            .await?
            .context("Query one error")
    }

    /// Query for an optional row
    pub async fn query_opt(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<tokio_postgres::Row>> {
        let client = self.get_client().await?;
        bounded(QUERY_TIMEOUT, client.query_opt(sql, params))
            .await?
            .context("Query opt error")
    }

    /// Whether the database answers a trivial query within [`PING_TIMEOUT`]
    pub async fn check_health(&self) -> bool {
        let probe = async {
            let client = self.pool.get().await.map_err(|e| anyhow!(e))?;
            client.execute("SELECT 1", &[]).await.map_err(|e| anyhow!(e))
        };

        match tokio::time::timeout(PING_TIMEOUT, probe).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!("Database health check failed: {}", e);
                false
            }
            Err(_) => {
                warn!("Database health check timed out");
                false
            }
        }
    }

    /// Provider name
    pub fn name(&self) -> &str {
        &self.name
    }
}

async fn bounded<F: Future>(limit: Duration, fut: F) -> Result<F::Output> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| AgentError::Timeout(format!("Database operation exceeded {:?}", limit)).into())
}

/// Build a TLS connector for the requested SSL mode
fn build_tls_connector(mode: SslMode) -> Result<TlsConnector> {
    let mut builder = TlsConnector::builder();

    // sslmode=prefer accepts any server certificate
    if matches!(mode, SslMode::Prefer) {
        builder.danger_accept_invalid_certs(true);
    }

    builder.build().context("Failed to build TLS connector")
}
