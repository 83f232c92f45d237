//! Validation and application of incoming metric records
use log::{debug, error, warn};
use std::sync::Arc;

use crate::auth::Authenticator;
use crate::error::{IngestError, IngestResult};
use crate::metrics::{MetricKind, MetricRecord};
use crate::storage::Storage;

/// Applies updates to a storage backend and answers queries from it
pub struct IngestService {
    storage: Arc<dyn Storage>,
    authenticator: Authenticator,
}

impl IngestService {
    /// Create a service over `storage`; a non-empty `key` enables tag checks
    pub fn new(storage: Arc<dyn Storage>, key: Option<&str>) -> Self {
        Self {
            storage,
            authenticator: Authenticator::new(key),
        }
    }

    /// The backing storage
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Validate, authenticate and apply one record.
    ///
    /// Gauges overwrite the stored value; counters add their delta to it.
    pub async fn apply_single(&self, record: &MetricRecord) -> IngestResult<()> {
        let kind = record.validate()?;

        if !self.authenticator.verify_tag(record) {
            return Err(IngestError::WrongHash(record.id.clone()));
        }

        match kind {
            MetricKind::Gauge => {
                let value = record.value.unwrap_or_default();
                self.storage
                    .set_gauge(&record.id, value)
                    .await
                    .map_err(|e| IngestError::StorageError(format!("{:#}", e)))?;
                debug!("Gauge {} set to {}", record.id, value);
            }
            MetricKind::Counter => {
                let delta = record.delta.unwrap_or_default();
                let total = self
                    .storage
                    .add_counter(&record.id, delta)
                    .await
                    .map_err(|e| IngestError::StorageError(format!("{:#}", e)))?;
                debug!("Counter {} increased by {} to {}", record.id, delta, total);
            }
        }

        Ok(())
    }

    /// Apply every record in order, skipping the ones that fail.
    ///
    /// Returns the number of records applied.
    pub async fn apply_batch(&self, records: &[MetricRecord]) -> IngestResult<usize> {
        let mut applied = 0;
        for record in records {
            match self.apply_single(record).await {
                Ok(()) => applied += 1,
                Err(e) => warn!("Skipping metric {:?} in batch: {}", record.id, e),
            }
        }

        debug!("Applied {} of {} batched metrics", applied, records.len());
        Ok(applied)
    }

    /// Look up the metric named and typed by `request` and serialize it as
    /// a record, tagged when a key is configured
    pub async fn query(&self, request: &MetricRecord) -> IngestResult<Vec<u8>> {
        let kind: MetricKind = request.mtype.parse()?;

        let mut record = match kind {
            MetricKind::Gauge => {
                let value = self
                    .storage
                    .get_gauge(&request.id)
                    .await
                    .map_err(|e| IngestError::StorageError(format!("{:#}", e)))?
                    .ok_or_else(|| IngestError::NoSuchMetric(request.id.clone()))?;
                MetricRecord::gauge(request.id.as_str(), value)
            }
            MetricKind::Counter => {
                let delta = self
                    .storage
                    .get_counter(&request.id)
                    .await
                    .map_err(|e| IngestError::StorageError(format!("{:#}", e)))?
                    .ok_or_else(|| IngestError::NoSuchMetric(request.id.clone()))?;
                MetricRecord::counter(request.id.as_str(), delta)
            }
        };

        self.authenticator.sign(&mut record);
        Ok(serde_json::to_vec(&record)?)
    }

    /// Every stored metric name; empty if the storage cannot be read
    pub async fn list_known_names(&self) -> Vec<String> {
        match self.storage.list_names().await {
            Ok(names) => names,
            Err(e) => {
                error!("Failed to list metric names: {:#}", e);
                Vec::new()
            }
        }
    }

    pub async fn is_storage_healthy(&self) -> bool {
        match self.storage.health_check().await {
            Ok(healthy) => healthy,
            Err(e) => {
                warn!("Storage health check failed: {:#}", e);
                false
            }
        }
    }

    /// Decode one JSON record and apply it
    pub async fn update_from_json(&self, body: &[u8]) -> IngestResult<()> {
        let record: MetricRecord = serde_json::from_slice(body)?;
        self.apply_single(&record).await
    }

    /// Decode a JSON array of records and apply them as a batch
    pub async fn update_batch_from_json(&self, body: &[u8]) -> IngestResult<usize> {
        let records: Vec<MetricRecord> = serde_json::from_slice(body)?;
        self.apply_batch(&records).await
    }

    /// Decode a JSON query record and answer it
    pub async fn value_from_json(&self, body: &[u8]) -> IngestResult<Vec<u8>> {
        let request: MetricRecord = serde_json::from_slice(body)?;
        self.query(&request).await
    }
}
