use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tally_config::Config;
use tally_metrics::{Metric, MetricRecord, MetricValue};
use tokio::fs::DirBuilder;

use crate::store::{MetricStore, StoreError, StoredMetric, apply_update};

/// A single metric in the snapshot file.
#[derive(Debug, Deserialize, Serialize)]
struct SnapshotEntry {
    #[serde(flatten)]
    record: MetricRecord,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    deleted_at: Option<DateTime<Utc>>,
}

impl SnapshotEntry {
    fn new(name: &str, stored: &StoredMetric) -> Self {
        Self {
            record: MetricRecord::from(&Metric::new(name, stored.value)),
            created_at: stored.created_at,
            updated_at: stored.updated_at,
            deleted_at: stored.deleted_at,
        }
    }
}

#[derive(Clone, Debug, Default)]
struct Metrics {
    live: BTreeMap<String, StoredMetric>,
    deleted: Vec<(String, StoredMetric)>,
}

impl Metrics {
    fn to_snapshot(&self) -> Vec<SnapshotEntry> {
        let live = self.live.iter().map(|(name, m)| SnapshotEntry::new(name, m));
        let deleted = self.deleted.iter().map(|(name, m)| SnapshotEntry::new(name, m));
        live.chain(deleted).collect()
    }

    fn from_snapshot(entries: Vec<SnapshotEntry>) -> Result<Self, StoreError> {
        let mut metrics = Self::default();

        for entry in entries {
            let name = entry.record.id.clone();
            let metric =
                Metric::try_from(entry.record).map_err(|_| StoreError::Corrupted(name.clone()))?;

            let stored = StoredMetric {
                value: metric.value,
                created_at: entry.created_at,
                updated_at: entry.updated_at,
                deleted_at: entry.deleted_at,
            };

            if stored.is_live() {
                metrics.live.insert(name, stored);
            } else {
                metrics.deleted.push((name, stored));
            }
        }

        Ok(metrics)
    }

    fn serialize(&self) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec_pretty(&self.to_snapshot()).map_err(StoreError::backend)
    }

    /// Applies a batch. On error, nothing is changed.
    fn apply(&mut self, batch: &[Metric], now: DateTime<Utc>) -> Result<Vec<Metric>, StoreError> {
        let mut staged = BTreeMap::<&str, MetricValue>::new();
        let mut results = Vec::with_capacity(batch.len());

        for metric in batch {
            let name = metric.name.as_str();
            let current = match staged.get(name) {
                Some(value) => Some(*value),
                None => self.live.get(name).map(|stored| stored.value),
            };

            let value = apply_update(name, current, metric.value)?;
            staged.insert(name, value);
            results.push(Metric::new(name, value));
        }

        for (name, value) in staged {
            match self.live.get_mut(name) {
                Some(stored) => {
                    stored.value = value;
                    stored.updated_at = now;
                }
                None => {
                    self.live.insert(name.to_owned(), StoredMetric::new(value, now));
                }
            }
        }

        Ok(results)
    }

    fn delete(&mut self, name: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let Some(mut stored) = self.live.remove(name) else {
            return Err(StoreError::NotFound);
        };

        stored.deleted_at = Some(now);
        self.deleted.push((name.to_owned(), stored));
        Ok(())
    }
}

#[derive(Debug)]
struct Snapshot {
    path: PathBuf,
    sync: bool,
    // Serializes writers so the newest state always lands last.
    write_lock: tokio::sync::Mutex<()>,
}

impl Snapshot {
    async fn write(&self, data: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            DirBuilder::new()
                .recursive(true)
                .create(parent)
                .await
                .map_err(StoreError::backend)?;
        }

        // Write to a sibling file first, so readers never see a partial snapshot.
        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, data)
            .await
            .map_err(StoreError::backend)?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(StoreError::backend)?;

        tally_log::trace!("flushed snapshot to {}", self.path.display());
        Ok(())
    }
}

/// Stores metrics in memory, optionally persisted to a JSON snapshot file.
///
/// With a synchronous snapshot, every change is written to the file before it becomes visible. If
/// writing fails, the change is discarded. Otherwise, the snapshot is written by
/// [`flush`](MetricStore::flush), which the server calls periodically and on shutdown.
#[derive(Debug, Default)]
pub struct MemoryStore {
    metrics: Mutex<Metrics>,
    snapshot: Option<Snapshot>,
}

impl MemoryStore {
    /// Creates an empty store without persistence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store persisted to the given snapshot file.
    ///
    /// If `restore` is set, existing metrics are loaded from the file. A missing file is not an
    /// error.
    pub async fn with_snapshot(
        path: impl Into<PathBuf>,
        sync: bool,
        restore: bool,
    ) -> Result<Self, StoreError> {
        let path = path.into();

        let metrics = if restore {
            Self::load(&path).await?
        } else {
            Metrics::default()
        };

        Ok(Self {
            metrics: Mutex::new(metrics),
            snapshot: Some(Snapshot {
                path,
                sync,
                write_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Creates the store as configured in the `server` section.
    pub async fn prepare(config: &Config) -> Result<Self, StoreError> {
        match config.file_storage_path() {
            Some(path) => {
                let sync = config.store_interval().is_none();
                Self::with_snapshot(path, sync, config.restore()).await
            }
            None => Ok(Self::new()),
        }
    }

    async fn load(path: &Path) -> Result<Metrics, StoreError> {
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                tally_log::info!("no snapshot at {}, starting empty", path.display());
                return Ok(Metrics::default());
            }
            Err(error) => return Err(StoreError::backend(error)),
        };

        let entries: Vec<SnapshotEntry> =
            serde_json::from_slice(&data).map_err(StoreError::backend)?;
        let metrics = Metrics::from_snapshot(entries)?;

        tally_log::info!(
            "restored {} metrics from {}",
            metrics.live.len(),
            path.display()
        );
        Ok(metrics)
    }

    /// Runs `change` against the metrics and commits the result.
    ///
    /// With a synchronous snapshot, the change runs on a copy that replaces the live state only
    /// after it was written to disk. All synchronous writers hold the snapshot lock, so the live
    /// state cannot move in between.
    async fn update<T>(
        &self,
        change: impl FnOnce(&mut Metrics) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let Some(snapshot) = self.snapshot.as_ref().filter(|s| s.sync) else {
            return change(&mut self.metrics.lock());
        };

        let _guard = snapshot.write_lock.lock().await;
        let mut next = self.metrics.lock().clone();
        let result = change(&mut next)?;

        snapshot.write(&next.serialize()?).await?;
        *self.metrics.lock() = next;

        Ok(result)
    }

    #[cfg(test)]
    fn get_stored(&self, name: &str) -> Option<StoredMetric> {
        self.metrics.lock().live.get(name).cloned()
    }

    #[cfg(test)]
    fn deleted_count(&self) -> usize {
        self.metrics.lock().deleted.len()
    }
}

impl MetricStore for MemoryStore {
    async fn upsert(&self, batch: &[Metric]) -> Result<Vec<Metric>, StoreError> {
        let now = Utc::now();
        self.update(|metrics| metrics.apply(batch, now)).await
    }

    async fn get(&self, name: &str) -> Result<Option<Metric>, StoreError> {
        let metrics = self.metrics.lock();
        Ok(metrics
            .live
            .get(name)
            .map(|stored| Metric::new(name, stored.value)))
    }

    async fn list(&self) -> Result<Vec<Metric>, StoreError> {
        let metrics = self.metrics.lock();
        Ok(metrics
            .live
            .iter()
            .map(|(name, stored)| Metric::new(name.as_str(), stored.value))
            .collect())
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        self.update(|metrics| metrics.delete(name, now)).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let Some(ref snapshot) = self.snapshot else {
            return Ok(());
        };

        let _guard = snapshot.write_lock.lock().await;
        let data = self.metrics.lock().serialize()?;
        snapshot.write(&data).await
    }
}
