use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use tally_metrics::Metric;
use tokio::sync::{Mutex, MutexGuard};

use crate::store::{MetricStore, StoreError};

/// Default number of lock shards.
const DEFAULT_SHARDS: usize = 64;

/// A fixed table of locks addressed by metric name.
///
/// Names hash to shards, so two names may share a lock. Callers lock all shards of a batch at once
/// in ascending order, which rules out deadlocks between batches.
#[derive(Debug)]
pub struct NameLocks {
    shards: Box<[Mutex<()>]>,
}

impl NameLocks {
    /// Creates a lock table with the given number of shards.
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    fn shard(&self, name: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Locks every shard covering the given names.
    pub async fn lock<'a, I>(&self, names: I) -> Vec<MutexGuard<'_, ()>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut indices = names
            .into_iter()
            .map(|name| self.shard(name))
            .collect::<Vec<_>>();
        indices.sort_unstable();
        indices.dedup();

        let mut guards = Vec::with_capacity(indices.len());
        for index in indices {
            guards.push(self.shards[index].lock().await);
        }
        guards
    }
}

impl Default for NameLocks {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}

/// Applies batches of metrics to the storage backend.
///
/// Read-modify-write cycles on the same name never interleave: the engine holds the locks of all
/// names in a batch until the store has committed it. Batches touching disjoint shards proceed in
/// parallel.
#[derive(Debug)]
pub struct UpsertEngine<S> {
    store: S,
    locks: NameLocks,
}

impl<S: MetricStore> UpsertEngine<S> {
    /// Creates an engine on top of a store.
    pub fn new(store: S) -> Self {
        Self {
            store,
            locks: NameLocks::default(),
        }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Applies a batch atomically and returns the stored values in batch order.
    pub async fn upsert(&self, batch: &[Metric]) -> Result<Vec<Metric>, StoreError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let _guards = self
            .locks
            .lock(batch.iter().map(|metric| metric.name.as_str()))
            .await;

        self.store.upsert(batch).await
    }

    /// Returns the live metric with the given name.
    pub async fn get(&self, name: &str) -> Result<Option<Metric>, StoreError> {
        self.store.get(name).await
    }

    /// Returns all live metrics.
    pub async fn list(&self) -> Result<Vec<Metric>, StoreError> {
        self.store.list().await
    }

    /// Checks that the store is reachable.
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.store.ping().await
    }

    /// Persists pending state of the store.
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.store.flush().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tally_metrics::MetricValue;

    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_lock_dedups_shards() {
        let locks = NameLocks::new(4);
        let guards = locks.lock(["a", "a", "a"]).await;
        assert_eq!(guards.len(), 1);
    }

    #[tokio::test]
    async fn test_single_shard_table() {
        let locks = NameLocks::new(1);
        let guards = locks.lock(["a", "b", "c"]).await;
        assert_eq!(guards.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let engine = UpsertEngine::new(MemoryStore::new());
        assert!(engine.upsert(&[]).await.unwrap().is_empty());
        assert!(engine.list().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_counters_accumulate() {
        let engine = Arc::new(UpsertEngine::new(MemoryStore::new()));

        let tasks = (0..50)
            .map(|i| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    let batch = vec![
                        Metric::counter("Requests", 1),
                        Metric::counter(format!("Worker{}", i % 5), 2),
                    ];
                    engine.upsert(&batch).await.unwrap();
                })
            })
            .collect::<Vec<_>>();

        for task in tasks {
            task.await.unwrap();
        }

        let requests = engine.get("Requests").await.unwrap().unwrap();
        assert_eq!(requests.value, MetricValue::Counter(50));

        for i in 0..5 {
            let worker = engine.get(&format!("Worker{i}")).await.unwrap().unwrap();
            assert_eq!(worker.value, MetricValue::Counter(20));
        }
    }

    #[tokio::test]
    async fn test_single_and_batch_equivalent() {
        let single = UpsertEngine::new(MemoryStore::new());
        let batched = UpsertEngine::new(MemoryStore::new());

        let metrics = vec![
            Metric::counter("Requests", 5),
            Metric::gauge("Temp", 3.14),
            Metric::counter("Requests", 5),
            Metric::gauge("Temp", 9.8),
        ];

        for metric in &metrics {
            single.upsert(std::slice::from_ref(metric)).await.unwrap();
        }
        batched.upsert(&metrics).await.unwrap();

        assert_eq!(single.list().await.unwrap(), batched.list().await.unwrap());
        assert_eq!(
            single.list().await.unwrap(),
            vec![Metric::counter("Requests", 10), Metric::gauge("Temp", 9.8)]
        );
    }
}
