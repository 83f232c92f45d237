use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::error::{AgentError, Result};
use crate::metrics::MetricSet;
use crate::storage::Storage;

/// Where and how often the in-memory state is persisted
#[derive(Debug, Clone, Default)]
pub struct SnapshotConfig {
    /// Snapshot file; `None` keeps everything in memory only
    pub path: Option<PathBuf>,
    /// Flush period; zero saves synchronously after every write
    pub interval: Duration,
    /// Load the snapshot file on open
    pub restore: bool,
}

/// Metric storage held in memory, optionally mirrored to a JSON snapshot file
pub struct MemoryStorage {
    metrics: Mutex<MetricSet>,
    dirty: AtomicBool,
    snapshot: SnapshotConfig,
    // Held from taking the copy until the file is replaced
    file_lock: tokio::sync::Mutex<()>,
    flusher: Mutex<Option<Flusher>>,
}

/// Background snapshot task and the signal that stops it
struct Flusher {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl MemoryStorage {
    /// Create a purely in-memory storage
    pub fn new() -> Self {
        Self::with_metrics(MetricSet::new(), SnapshotConfig::default())
    }

    fn with_metrics(metrics: MetricSet, snapshot: SnapshotConfig) -> Self {
        Self {
            metrics: Mutex::new(metrics),
            dirty: AtomicBool::new(false),
            snapshot,
            file_lock: tokio::sync::Mutex::new(()),
            flusher: Mutex::new(None),
        }
    }

    /// Open a storage backed by `snapshot`.
    ///
    /// With `restore` set, the snapshot file is loaded first; a missing or
    /// unreadable file leaves the storage empty. With a path and a non-zero
    /// interval, a background task flushes changes every interval until
    /// [`Storage::close`] is called.
    pub async fn open(snapshot: SnapshotConfig) -> Arc<Self> {
        let metrics = match (&snapshot.path, snapshot.restore) {
            (Some(path), true) => restore(path).await,
            _ => MetricSet::new(),
        };

        let interval = snapshot.interval;
        let periodic = snapshot.path.is_some() && !interval.is_zero();
        let storage = Arc::new(Self::with_metrics(metrics, snapshot));

        if periodic {
            let flusher = spawn_flusher(Arc::downgrade(&storage), interval);
            if let Ok(mut slot) = storage.flusher.lock() {
                *slot = Some(flusher);
            }
        }

        storage
    }

    /// Write the snapshot file if anything changed since the last write
    pub async fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        if let Err(e) = self.save().await {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> Result<MetricSet> {
        Ok(self.lock()?.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, MetricSet>> {
        self.metrics
            .lock()
            .map_err(|_| AgentError::Storage("Lock poisoned".to_string()).into())
    }

    async fn save(&self) -> Result<()> {
        let Some(path) = &self.snapshot.path else {
            return Ok(());
        };

        let _guard = self.file_lock.lock().await;
        let payload = serde_json::to_vec(&self.snapshot()?).map_err(AgentError::from)?;

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &payload).await.map_err(|e| {
            AgentError::Storage(format!("Failed to write snapshot {}: {}", tmp.display(), e))
        })?;
        tokio::fs::rename(&tmp, path).await.map_err(|e| {
            AgentError::Storage(format!("Failed to replace snapshot {}: {}", path.display(), e))
        })?;

        debug!("Snapshot written to {}", path.display());
        Ok(())
    }

    async fn after_write(&self) -> Result<()> {
        if self.snapshot.path.is_some() && self.snapshot.interval.is_zero() {
            return self.save().await;
        }
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Stop the background flusher, letting a flush in progress finish
    async fn stop_flusher(&self) -> Result<()> {
        let flusher = self
            .flusher
            .lock()
            .map_err(|_| AgentError::Storage("Lock poisoned".to_string()))?
            .take();

        if let Some(Flusher { stop, handle }) = flusher {
            let _ = stop.send(());
            if let Err(e) = handle.await {
                warn!("Snapshot flusher ended abnormally: {}", e);
            }
        }
        Ok(())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_counter(&self, name: &str) -> Result<Option<i64>> {
        Ok(self.lock()?.get_counter(name))
    }

    async fn set_counter(&self, name: &str, value: i64) -> Result<()> {
        self.lock()?.set_counter(name, value);
        self.after_write().await
    }

    async fn add_counter(&self, name: &str, delta: i64) -> Result<i64> {
        let value = self.lock()?.increment_counter(name, delta);
        self.after_write().await?;
        Ok(value)
    }

    async fn get_gauge(&self, name: &str) -> Result<Option<f64>> {
        Ok(self.lock()?.get_gauge(name))
    }

    async fn set_gauge(&self, name: &str, value: f64) -> Result<()> {
        self.lock()?.set_gauge(name, value);
        self.after_write().await
    }

    async fn list_names(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.names())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    async fn close(&self) -> Result<()> {
        self.stop_flusher().await?;

        if self.snapshot.path.is_some() {
            self.dirty.store(false, Ordering::Release);
            self.save().await?;
            info!("Final snapshot written");
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

fn spawn_flusher(storage: Weak<MemoryStorage>, period: Duration) -> Flusher {
    let (stop, mut stopped) = oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = &mut stopped => break,
            }

            let Some(storage) = storage.upgrade() else {
                break;
            };
            if let Err(e) = storage.flush().await {
                error!("Snapshot flush failed: {:#}", e);
            }
        }
        debug!("Snapshot flusher stopped");
    });

    Flusher { stop, handle }
}

async fn restore(path: &Path) -> MetricSet {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) => {
            warn!("Cannot read snapshot {}, starting empty: {}", path.display(), e);
            return MetricSet::new();
        }
    };

    match serde_json::from_slice::<MetricSet>(&data) {
        Ok(metrics) => {
            info!("Restored {} metrics from {}", metrics.len(), path.display());
            metrics
        }
        Err(e) => {
            warn!("Corrupt snapshot {}, starting empty: {}", path.display(), e);
            MetricSet::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn snapshot_config(dir: &TempDir, interval: Duration, restore: bool) -> SnapshotConfig {
        SnapshotConfig {
            path: Some(dir.path().join("metrics.json")),
            interval,
            restore,
        }
    }

    fn read_snapshot(dir: &TempDir) -> MetricSet {
        let data = std::fs::read(dir.path().join("metrics.json")).unwrap();
        serde_json::from_slice(&data).unwrap()
    }

    #[tokio::test]
    async fn test_counters_accumulate_and_gauges_overwrite() {
        let storage = MemoryStorage::new();

        assert_eq!(storage.add_counter("PollCount", 5).await.unwrap(), 5);
        assert_eq!(storage.add_counter("PollCount", 7).await.unwrap(), 12);
        storage.set_gauge("Alloc", 1.0).await.unwrap();
        storage.set_gauge("Alloc", 2.5).await.unwrap();

        assert_eq!(storage.get_counter("PollCount").await.unwrap(), Some(12));
        assert_eq!(storage.get_gauge("Alloc").await.unwrap(), Some(2.5));
        assert_eq!(storage.get_gauge("PollCount").await.unwrap(), None);

        let mut names = storage.list_names().await.unwrap();
        names.sort();
        assert_eq!(names, vec!["Alloc", "PollCount"]);
    }

    #[tokio::test]
    async fn test_sync_mode_saves_after_every_write() {
        let dir = TempDir::new().unwrap();
        let storage = MemoryStorage::open(snapshot_config(&dir, Duration::ZERO, false)).await;

        storage.set_gauge("Alloc", 3.0).await.unwrap();
        assert_eq!(read_snapshot(&dir).get_gauge("Alloc"), Some(3.0));

        storage.add_counter("PollCount", 2).await.unwrap();
        assert_eq!(read_snapshot(&dir).get_counter("PollCount"), Some(2));
    }

    #[tokio::test]
    async fn test_restore_after_restart() {
        let dir = TempDir::new().unwrap();

        let storage = MemoryStorage::open(snapshot_config(&dir, Duration::ZERO, true)).await;
        storage.add_counter("PollCount", 3).await.unwrap();
        storage.set_gauge("Alloc", 1.25).await.unwrap();
        storage.close().await.unwrap();
        drop(storage);

        let restored = MemoryStorage::open(snapshot_config(&dir, Duration::ZERO, true)).await;
        assert_eq!(restored.get_counter("PollCount").await.unwrap(), Some(3));
        assert_eq!(restored.get_gauge("Alloc").await.unwrap(), Some(1.25));
    }

    #[tokio::test]
    async fn test_restore_disabled_starts_empty() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("metrics.json"),
            r#"{"GaugeMetrics":{"Alloc":1.0},"CounterMetrics":{}}"#,
        )
        .unwrap();

        let storage = MemoryStorage::open(snapshot_config(&dir, Duration::ZERO, false)).await;
        assert!(storage.snapshot().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_or_corrupt_snapshot_starts_empty() {
        let dir = TempDir::new().unwrap();
        let storage = MemoryStorage::open(snapshot_config(&dir, Duration::ZERO, true)).await;
        assert!(storage.snapshot().unwrap().is_empty());

        std::fs::write(dir.path().join("metrics.json"), b"{not json").unwrap();
        let storage = MemoryStorage::open(snapshot_config(&dir, Duration::ZERO, true)).await;
        assert!(storage.snapshot().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_writes_snapshot() {
        let dir = TempDir::new().unwrap();
        let storage =
            MemoryStorage::open(snapshot_config(&dir, Duration::from_secs(3600), false)).await;

        storage.set_gauge("Alloc", 9.0).await.unwrap();
        assert!(!dir.path().join("metrics.json").exists());

        storage.close().await.unwrap();
        assert_eq!(read_snapshot(&dir).get_gauge("Alloc"), Some(9.0));
    }

    #[tokio::test]
    async fn test_periodic_flush_writes_only_when_dirty() {
        let dir = TempDir::new().unwrap();
        let storage =
            MemoryStorage::open(snapshot_config(&dir, Duration::from_millis(20), false)).await;

        time::sleep(Duration::from_millis(80)).await;
        assert!(!dir.path().join("metrics.json").exists());

        storage.add_counter("PollCount", 4).await.unwrap();
        time::sleep(Duration::from_millis(150)).await;
        assert_eq!(read_snapshot(&dir).get_counter("PollCount"), Some(4));

        storage.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_sync_mode_file_matches_memory_after_concurrent_writes() {
        for round in 0..20 {
            let dir = TempDir::new().unwrap();
            let storage = MemoryStorage::open(snapshot_config(&dir, Duration::ZERO, false)).await;

            let writers: Vec<_> = (0..32)
                .map(|i| {
                    let storage = Arc::clone(&storage);
                    tokio::spawn(async move {
                        storage.set_gauge(&format!("Gauge{}", i), i as f64).await
                    })
                })
                .collect();
            for writer in writers {
                writer.await.unwrap().unwrap();
            }

            let in_memory = storage.snapshot().unwrap();
            assert_eq!(in_memory.len(), 32);
            assert_eq!(read_snapshot(&dir), in_memory, "round {}", round);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_waits_for_running_flush() {
        let dir = TempDir::new().unwrap();
        let storage =
            MemoryStorage::open(snapshot_config(&dir, Duration::from_millis(1), false)).await;

        for i in 0..200 {
            storage.add_counter("PollCount", 1).await.unwrap();
            if i % 50 == 0 {
                time::sleep(Duration::from_millis(2)).await;
            }
        }
        storage.close().await.unwrap();

        assert!(storage.flusher.lock().unwrap().is_none());
        assert!(!dir.path().join("metrics.tmp").exists());
        assert_eq!(read_snapshot(&dir).get_counter("PollCount"), Some(200));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_counter_adds_are_not_lost() {
        let storage = Arc::new(MemoryStorage::new());

        let adders: Vec<_> = (0..64)
            .map(|_| {
                let storage = Arc::clone(&storage);
                tokio::spawn(async move { storage.add_counter("Hits", 1).await })
            })
            .collect();
        for adder in adders {
            adder.await.unwrap().unwrap();
        }

        assert_eq!(storage.get_counter("Hits").await.unwrap(), Some(64));
    }

    #[tokio::test]
    async fn test_without_path_nothing_is_written() {
        let storage = MemoryStorage::open(SnapshotConfig {
            path: None,
            interval: Duration::ZERO,
            restore: true,
        })
        .await;

        storage.set_gauge("Alloc", 1.0).await.unwrap();
        storage.close().await.unwrap();
        assert_eq!(storage.get_gauge("Alloc").await.unwrap(), Some(1.0));
    }
}
