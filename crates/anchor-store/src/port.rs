//! The coordination store port.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::StoreResult;
use crate::types::{KvEntry, KvOptions, WatchEvent, WatchTarget};

/// Stream of change notifications. Ends when the subscription is dropped
/// by the store; an `Err` item signals a disruption (e.g. lag).
pub type WatchStream = BoxStream<'static, StoreResult<WatchEvent>>;

/// Shared handle used by every component in a process.
pub type SharedStore = Arc<dyn CoordinationStore>;

/// Key-value operations with optimistic concurrency, TTL expiry and watch.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Read a key. Expired entries are never returned.
    async fn get(&self, key: &str) -> StoreResult<Option<KvEntry>>;

    /// Write a key and return the new revision.
    ///
    /// Fails with `KeyExists` (`create_only` on a present key), `KeyNotFound`
    /// (`update_only` on an absent key) or `RevisionMismatch` (supplied
    /// revision differs from the stored one).
    async fn put(&self, key: &str, value: Vec<u8>, options: KvOptions) -> StoreResult<u64>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// All live entries whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> StoreResult<Vec<KvEntry>>;

    /// Subscribe to changes on a key or prefix.
    async fn watch(&self, target: WatchTarget) -> StoreResult<WatchStream>;
}
