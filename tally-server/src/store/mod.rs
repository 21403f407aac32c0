//! Storage backends for metrics.
//!
//! A store applies batches atomically: either all metrics of a batch are written or none. Deleted
//! metrics are soft deleted. They stay in storage but are invisible to reads and to the check
//! deciding whether an update inserts a new metric.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tally_metrics::{Metric, MetricValue, TypeMismatch};

mod memory;
mod sqlite;

pub use self::memory::*;
pub use self::sqlite::*;

/// An error returned by a [`MetricStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No live metric exists with this name.
    #[error("metric not found")]
    NotFound,

    /// The update does not match the type of the stored metric.
    #[error("type conflict for metric {name:?}")]
    TypeConflict {
        /// The name of the conflicting metric.
        name: String,
        /// The conflicting types.
        #[source]
        source: TypeMismatch,
    },

    /// The stored data could not be decoded.
    #[error("corrupted record for metric {0:?}")]
    Corrupted(String),

    /// The backend failed to read or write.
    #[error("storage backend failed")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    fn backend(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(error))
    }
}

/// A stored metric with its bookkeeping timestamps.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredMetric {
    /// The accumulated value.
    pub value: MetricValue,
    /// When the metric was first inserted.
    pub created_at: DateTime<Utc>,
    /// When the metric was last updated.
    pub updated_at: DateTime<Utc>,
    /// When the metric was soft deleted.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl StoredMetric {
    fn new(value: MetricValue, now: DateTime<Utc>) -> Self {
        Self {
            value,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// Computes the value stored after applying `update` on top of an optional live value.
fn apply_update(
    name: &str,
    stored: Option<MetricValue>,
    update: MetricValue,
) -> Result<MetricValue, StoreError> {
    match stored {
        None => Ok(update),
        Some(stored) => update
            .apply_to(stored)
            .map_err(|source| StoreError::TypeConflict {
                name: name.to_owned(),
                source,
            }),
    }
}

/// A storage backend for metrics.
pub trait MetricStore: Send + Sync {
    /// Applies a batch atomically and returns the stored value of every metric in batch order.
    ///
    /// Counters add their delta to the stored value, gauges replace it. If any metric conflicts
    /// with the type of a live metric, nothing is written.
    fn upsert(
        &self,
        batch: &[Metric],
    ) -> impl Future<Output = Result<Vec<Metric>, StoreError>> + Send;

    /// Returns the live metric with the given name.
    fn get(&self, name: &str) -> impl Future<Output = Result<Option<Metric>, StoreError>> + Send;

    /// Returns all live metrics ordered by name.
    fn list(&self) -> impl Future<Output = Result<Vec<Metric>, StoreError>> + Send;

    /// Soft deletes the live metric with the given name.
    fn delete(&self, name: &str) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Checks that the backend is reachable.
    fn ping(&self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Persists pending state. A no-op for backends that write through.
    fn flush(&self) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// The configured storage backend.
#[derive(Clone, Debug)]
pub enum Storage {
    /// Metrics held in memory with an optional snapshot file.
    Memory(Arc<MemoryStore>),
    /// Metrics held in a SQLite database.
    Sqlite(SqliteStore),
}

impl Storage {
    /// Creates the backend selected by the config.
    ///
    /// A configured database takes precedence over the memory store.
    pub async fn prepare(config: &tally_config::Config) -> Result<Self, StoreError> {
        if config.database_path().is_some() {
            return Ok(Self::Sqlite(SqliteStore::prepare(config).await?));
        }

        Ok(Self::Memory(Arc::new(MemoryStore::prepare(config).await?)))
    }

    /// Returns the name of the backend for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Sqlite(_) => "sqlite",
        }
    }
}

impl MetricStore for Storage {
    async fn upsert(&self, batch: &[Metric]) -> Result<Vec<Metric>, StoreError> {
        match self {
            Self::Memory(store) => store.upsert(batch).await,
            Self::Sqlite(store) => store.upsert(batch).await,
        }
    }

    async fn get(&self, name: &str) -> Result<Option<Metric>, StoreError> {
        match self {
            Self::Memory(store) => store.get(name).await,
            Self::Sqlite(store) => store.get(name).await,
        }
    }

    async fn list(&self) -> Result<Vec<Metric>, StoreError> {
        match self {
            Self::Memory(store) => store.list().await,
            Self::Sqlite(store) => store.list().await,
        }
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        match self {
            Self::Memory(store) => store.delete(name).await,
            Self::Sqlite(store) => store.delete(name).await,
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        match self {
            Self::Memory(store) => store.ping().await,
            Self::Sqlite(store) => store.ping().await,
        }
    }

    async fn flush(&self) -> Result<(), StoreError> {
        match self {
            Self::Memory(store) => store.flush().await,
            Self::Sqlite(store) => store.flush().await,
        }
    }
}
