use async_trait::async_trait;
use log::{debug, info, warn};

use crate::connection::postgres::PostgresProvider;
use crate::error::{AgentError, Result};
use crate::metrics::MetricKind;
use crate::storage::Storage;

const EXPECTED_COLUMNS: [&str; 5] = ["mytype", "myid", "myvalue", "delta", "uid"];

const CREATE_TABLE: &str = "CREATE TABLE metrics (
    mytype text,
    myid text,
    myvalue double precision,
    delta bigint,
    uid text UNIQUE
)";

const TABLE_EXISTS: &str = "SELECT EXISTS (
    SELECT 1 FROM information_schema.tables
    WHERE table_schema = current_schema() AND table_name = 'metrics'
)";

const TABLE_COLUMNS: &str = "SELECT column_name::text FROM information_schema.columns
    WHERE table_schema = current_schema() AND table_name = 'metrics'";

/// Metric storage in a single PostgreSQL table
///
/// Each row is keyed by `uid`, the kind name followed by the metric name.
pub struct PostgresStorage {
    provider: PostgresProvider,
}

impl PostgresStorage {
    /// Connect to the database at `dsn` and make sure the metrics table
    /// has the expected shape
    pub async fn connect(dsn: &str) -> Result<Self> {
        let provider = PostgresProvider::connect(dsn, "postgres").await?;
        let storage = Self { provider };
        storage.ensure_schema().await?;
        Ok(storage)
    }

    async fn ensure_schema(&self) -> Result<()> {
        let exists: bool = self
            .provider
            .query_one(TABLE_EXISTS, &[])
            .await?
            .get(0);

        if exists {
            let rows = self.provider.query(TABLE_COLUMNS, &[]).await?;
            let columns: Vec<String> = rows.iter().map(|row| row.get(0)).collect();

            if EXPECTED_COLUMNS
                .iter()
                .all(|expected| columns.iter().any(|c| c == expected))
            {
                debug!("Metrics table is up to date");
                return Ok(());
            }

            warn!("Metrics table has unexpected columns {:?}, recreating it", columns);
            self.provider.execute("DROP TABLE metrics", &[]).await?;
        }

        self.provider.execute(CREATE_TABLE, &[]).await?;
        info!("Created metrics table");
        Ok(())
    }
}

fn uid(kind: MetricKind, name: &str) -> String {
    format!("{}{}", kind.as_str(), name)
}

fn storage_error(op: &str, name: &str, e: anyhow::Error) -> anyhow::Error {
    AgentError::Database(format!("{} {} failed: {:#}", op, name, e)).into()
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn get_counter(&self, name: &str) -> Result<Option<i64>> {
        let row = self
            .provider
            .query_opt(
                "SELECT delta FROM metrics WHERE uid = $1",
                &[&uid(MetricKind::Counter, name)],
            )
            .await
            .map_err(|e| storage_error("get counter", name, e))?;

        Ok(row.and_then(|r| r.get::<_, Option<i64>>(0)))
    }

    async fn set_counter(&self, name: &str, value: i64) -> Result<()> {
        self.provider
            .execute(
                "INSERT INTO metrics (mytype, myid, delta, uid) VALUES ($1, $2, $3, $4)
                 ON CONFLICT (uid) DO UPDATE SET delta = EXCLUDED.delta",
                &[
                    &MetricKind::Counter.as_str(),
                    &name,
                    &value,
                    &uid(MetricKind::Counter, name),
                ],
            )
            .await
            .map_err(|e| storage_error("set counter", name, e))?;
        Ok(())
    }

    async fn add_counter(&self, name: &str, delta: i64) -> Result<i64> {
        let row = self
            .provider
            .query_one(
                "INSERT INTO metrics (mytype, myid, delta, uid) VALUES ($1, $2, $3, $4)
                 ON CONFLICT (uid) DO UPDATE SET delta = COALESCE(metrics.delta, 0) + EXCLUDED.delta
                 RETURNING delta",
                &[
                    &MetricKind::Counter.as_str(),
                    &name,
                    &delta,
                    &uid(MetricKind::Counter, name),
                ],
            )
            .await
            .map_err(|e| storage_error("add counter", name, e))?;

        Ok(row.get(0))
    }

    async fn get_gauge(&self, name: &str) -> Result<Option<f64>> {
        let row = self
            .provider
            .query_opt(
                "SELECT myvalue FROM metrics WHERE uid = $1",
                &[&uid(MetricKind::Gauge, name)],
            )
            .await
            .map_err(|e| storage_error("get gauge", name, e))?;

        Ok(row.and_then(|r| r.get::<_, Option<f64>>(0)))
    }

    async fn set_gauge(&self, name: &str, value: f64) -> Result<()> {
        self.provider
            .execute(
                "INSERT INTO metrics (mytype, myid, myvalue, uid) VALUES ($1, $2, $3, $4)
                 ON CONFLICT (uid) DO UPDATE SET myvalue = EXCLUDED.myvalue",
                &[
                    &MetricKind::Gauge.as_str(),
                    &name,
                    &value,
                    &uid(MetricKind::Gauge, name),
                ],
            )
            .await
            .map_err(|e| storage_error("set gauge", name, e))?;
        Ok(())
    }

    async fn list_names(&self) -> Result<Vec<String>> {
        let rows = self
            .provider
            .query("SELECT DISTINCT myid FROM metrics", &[])
            .await
            .map_err(|e| AgentError::Database(format!("list names failed: {:#}", e)))?;

        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.provider.check_health().await)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        self.provider.name()
    }
}
