//! Per-operation timeout wrapper.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{StoreError, StoreResult};
use crate::port::{CoordinationStore, WatchStream};
use crate::types::{KvEntry, KvOptions, WatchTarget};

/// Bounds every store call by an explicit timeout.
///
/// An elapsed call surfaces as [`StoreError::Timeout`], which callers count
/// as a store failure.
pub struct TimedStore<S> {
    inner: S,
    timeout: Duration,
}

impl<S> TimedStore<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn bounded<T>(&self, op: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        tokio::time::timeout(self.timeout, op)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }
}

#[async_trait]
impl<S: CoordinationStore> CoordinationStore for TimedStore<S> {
    async fn get(&self, key: &str) -> StoreResult<Option<KvEntry>> {
        self.bounded(self.inner.get(key)).await
    }

    async fn put(&self, key: &str, value: Vec<u8>, options: KvOptions) -> StoreResult<u64> {
        self.bounded(self.inner.put(key, value, options)).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.bounded(self.inner.delete(key)).await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.bounded(self.inner.exists(key)).await
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<KvEntry>> {
        self.bounded(self.inner.list(prefix)).await
    }

    /// Only establishing the subscription is bounded.
    async fn watch(&self, target: WatchTarget) -> StoreResult<WatchStream> {
        self.bounded(self.inner.watch(target)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FaultyStore, RedbStore};

    #[tokio::test]
    async fn passes_through_fast_operations() {
        let store = TimedStore::new(RedbStore::open_in_memory().unwrap(), Duration::from_secs(1));
        store.put("k", b"x".to_vec(), KvOptions::default()).await.unwrap();
        assert!(store.exists("k").await.unwrap());
        assert_eq!(store.list("").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn slow_operations_time_out() {
        let faulty = FaultyStore::new(RedbStore::open_in_memory().unwrap());
        faulty.set_latency(Some(Duration::from_millis(200)));
        let store = TimedStore::new(faulty, Duration::from_millis(20));

        let err = store.get("k").await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout(t) if t == Duration::from_millis(20)));
        assert!(err.is_unavailable());
    }
}
