//! A store wrapper whose availability can be switched off.
//!
//! Used by failover drills and tests to reproduce store outages: while
//! unavailable every operation fails with [`StoreError::Unavailable`] and
//! open watch streams end with an error item.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use crate::error::{StoreError, StoreResult};
use crate::port::{CoordinationStore, WatchStream};
use crate::types::{KvEntry, KvOptions, WatchTarget};

#[derive(Default)]
struct FaultState {
    unavailable: AtomicBool,
    rejected: AtomicU64,
    latency: Mutex<Option<Duration>>,
}

pub struct FaultyStore<S> {
    inner: S,
    state: Arc<FaultState>,
}

impl<S> FaultyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            state: Arc::new(FaultState::default()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn set_available(&self, available: bool) {
        self.state.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        !self.state.unavailable.load(Ordering::SeqCst)
    }

    /// Delay injected before every operation.
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut guard) = self.state.latency.lock() {
            *guard = latency;
        }
    }

    /// Operations rejected while unavailable.
    pub fn rejected(&self) -> u64 {
        self.state.rejected.load(Ordering::Relaxed)
    }

    async fn gate(&self) -> StoreResult<()> {
        let latency = self.state.latency.lock().ok().and_then(|g| *g);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.state.unavailable.load(Ordering::SeqCst) {
            self.state.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(StoreError::Unavailable("injected fault".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl<S: CoordinationStore> CoordinationStore for FaultyStore<S> {
    async fn get(&self, key: &str) -> StoreResult<Option<KvEntry>> {
        self.gate().await?;
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Vec<u8>, options: KvOptions) -> StoreResult<u64> {
        self.gate().await?;
        self.inner.put(key, value, options).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.gate().await?;
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<KvEntry>> {
        self.gate().await?;
        self.inner.list(prefix).await
    }

    async fn watch(&self, target: WatchTarget) -> StoreResult<WatchStream> {
        self.gate().await?;
        let inner = self.inner.watch(target).await?;
        let state = self.state.clone();

        // Once the fault is switched on, yield one error and end the stream.
        let stream = futures::stream::unfold((inner, state, false), |(mut inner, state, done)| async move {
            if done {
                return None;
            }
            if state.unavailable.load(Ordering::SeqCst) {
                let err = StoreError::Unavailable("watch interrupted".to_string());
                return Some((Err(err), (inner, state, true)));
            }
            let item = inner.next().await?;
            if state.unavailable.load(Ordering::SeqCst) {
                let err = StoreError::Unavailable("watch interrupted".to_string());
                return Some((Err(err), (inner, state, true)));
            }
            Some((item, (inner, state, false)))
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RedbStore;

    #[tokio::test]
    async fn toggles_availability() {
        let store = FaultyStore::new(RedbStore::open_in_memory().unwrap());
        store.put("k", b"x".to_vec(), KvOptions::default()).await.unwrap();

        store.set_available(false);
        assert!(!store.is_available());
        let err = store.get("k").await.unwrap_err();
        assert!(err.is_unavailable());
        assert!(store.put("k", b"y".to_vec(), KvOptions::default()).await.is_err());
        assert_eq!(store.rejected(), 2);

        store.set_available(true);
        assert_eq!(store.get("k").await.unwrap().unwrap().value, b"x");
    }

    #[tokio::test]
    async fn open_watch_ends_after_fault() {
        let store = FaultyStore::new(RedbStore::open_in_memory().unwrap());
        let mut stream = store.watch(WatchTarget::Prefix(String::new())).await.unwrap();

        store.set_available(false);
        // The next inner event observes the fault.
        store
            .inner()
            .put("k", b"x".to_vec(), KvOptions::default())
            .await
            .unwrap();

        let item = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert!(item.is_err());
        assert!(stream.next().await.is_none());
    }
}
