use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite, SqliteConnection};
use tally_config::Config;
use tally_metrics::{Metric, MetricType, MetricValue};
use tokio::fs::DirBuilder;

use crate::store::{MetricStore, StoreError, apply_update};

/// Stores metrics in a SQLite database.
///
/// Every batch runs in a single transaction. Deleting a metric sets `deleted_at`, all queries only
/// consider rows where it is unset.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    db: Pool<Sqlite>,
    // SQLite allows a single writer. Serializing transactions here avoids busy errors when a
    // deferred transaction upgrades to a write lock.
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl SqliteStore {
    /// Opens the configured database, creating it and running migrations if necessary.
    pub async fn prepare(config: &Config) -> Result<Self, StoreError> {
        let Some(path) = config.database_path() else {
            return Err(StoreError::Backend("no database path configured".into()));
        };

        Self::open(path, config.database_max_connections()).await
    }

    /// Opens the database at `path`.
    pub async fn open(path: &Path, max_connections: u32) -> Result<Self, StoreError> {
        tally_log::info!("database file {}", path.display());
        Self::create_directory(path).await?;

        let options = SqliteConnectOptions::new()
            .filename(path)
            .journal_mode(SqliteJournalMode::Wal)
            // WAL mode is safe from corruption with synchronous=NORMAL.
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);

        let db = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(StoreError::backend)?;

        sqlx::migrate!("../migrations")
            .run(&db)
            .await
            .map_err(StoreError::backend)?;

        Ok(Self {
            db,
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    async fn create_directory(path: &Path) -> Result<(), StoreError> {
        let Some(parent) = path.parent() else {
            return Ok(());
        };

        if !parent.as_os_str().is_empty() && !parent.exists() {
            tally_log::debug!("creating directory for database: {}", parent.display());
            DirBuilder::new()
                .recursive(true)
                .create(parent)
                .await
                .map_err(StoreError::backend)?;
        }

        Ok(())
    }

    async fn fetch_live(
        conn: &mut SqliteConnection,
        name: &str,
    ) -> Result<Option<(i64, MetricValue)>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, type, delta, value FROM metrics WHERE name = ? AND deleted_at IS NULL",
        )
        .bind(name)
        .fetch_optional(conn)
        .await
        .map_err(StoreError::backend)?;

        match row {
            Some(row) => {
                let id: i64 = row.try_get("id").map_err(StoreError::backend)?;
                Ok(Some((id, decode_row(&row)?.value)))
            }
            None => Ok(None),
        }
    }
}

fn timestamp(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn value_columns(value: MetricValue) -> (Option<i64>, Option<f64>) {
    match value {
        MetricValue::Gauge(value) => (None, Some(value)),
        MetricValue::Counter(delta) => (Some(delta), None),
    }
}

fn decode_row(row: &SqliteRow) -> Result<Metric, StoreError> {
    let name: String = row.try_get("name").map_err(StoreError::backend)?;
    let ty: String = row.try_get("type").map_err(StoreError::backend)?;
    let delta: Option<i64> = row.try_get("delta").map_err(StoreError::backend)?;
    let value: Option<f64> = row.try_get("value").map_err(StoreError::backend)?;

    let value = match (ty.parse::<MetricType>(), delta, value) {
        (Ok(MetricType::Counter), Some(delta), _) => MetricValue::Counter(delta),
        (Ok(MetricType::Gauge), _, Some(value)) => MetricValue::Gauge(value),
        _ => return Err(StoreError::Corrupted(name)),
    };

    Ok(Metric::new(name, value))
}

impl MetricStore for SqliteStore {
    async fn upsert(&self, batch: &[Metric]) -> Result<Vec<Metric>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let now = timestamp(Utc::now());

        // Dropping the transaction without commit rolls back all previous statements.
        let mut tx = self.db.begin().await.map_err(StoreError::backend)?;
        let mut results = Vec::with_capacity(batch.len());

        for metric in batch {
            let existing = Self::fetch_live(&mut tx, &metric.name).await?;
            let value = apply_update(&metric.name, existing.map(|(_, v)| v), metric.value)?;
            let (delta, gauge) = value_columns(value);

            let query = match existing {
                Some((id, _)) => sqlx::query(
                    "UPDATE metrics SET delta = ?, value = ?, updated_at = ? WHERE id = ?",
                )
                .bind(delta)
                .bind(gauge)
                .bind(now)
                .bind(id),
                None => sqlx::query(
                    "INSERT INTO metrics (name, type, delta, value, created_at, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(metric.name.as_str())
                .bind(value.ty().as_str())
                .bind(delta)
                .bind(gauge)
                .bind(now)
                .bind(now),
            };

            query
                .execute(&mut *tx)
                .await
                .map_err(StoreError::backend)?;

            results.push(Metric::new(metric.name.as_str(), value));
        }

        tx.commit().await.map_err(StoreError::backend)?;
        Ok(results)
    }

    async fn get(&self, name: &str) -> Result<Option<Metric>, StoreError> {
        let row = sqlx::query(
            "SELECT name, type, delta, value FROM metrics WHERE name = ? AND deleted_at IS NULL",
        )
        .bind(name)
        .fetch_optional(&self.db)
        .await
        .map_err(StoreError::backend)?;

        row.as_ref().map(decode_row).transpose()
    }

    async fn list(&self) -> Result<Vec<Metric>, StoreError> {
        let rows = sqlx::query(
            "SELECT name, type, delta, value FROM metrics WHERE deleted_at IS NULL ORDER BY name",
        )
        .fetch_all(&self.db)
        .await
        .map_err(StoreError::backend)?;

        rows.iter().map(decode_row).collect()
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let result =
            sqlx::query("UPDATE metrics SET deleted_at = ? WHERE name = ? AND deleted_at IS NULL")
                .bind(timestamp(Utc::now()))
                .bind(name)
                .execute(&self.db)
                .await
                .map_err(StoreError::backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }

        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.db)
            .await
            .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
