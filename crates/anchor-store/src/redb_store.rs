//! Embedded coordination store backed by redb.
//!
//! Every write runs in a single redb write transaction, and redb admits one
//! writer at a time, so the existence and revision checks of a conditional
//! put observe exactly the state they overwrite. Revisions come from a
//! store-wide counter in the meta table. TTL entries carry an absolute
//! expiry; reads hide them once expired and [`RedbStore::run_reaper`]
//! removes them and publishes `Purge` events.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anchor_core::time::epoch_millis;
use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::port::{CoordinationStore, WatchStream};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

const WATCH_CHANNEL_CAPACITY: usize = 1024;

/// On-disk representation of an entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    value: Vec<u8>,
    revision: u64,
    created_at_ms: u64,
    updated_at_ms: u64,
    #[serde(default)]
    ttl_ms: Option<u64>,
    #[serde(default)]
    expires_at_ms: Option<u64>,
}

impl StoredEntry {
    fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }

    fn to_entry(&self, key: &str) -> KvEntry {
        KvEntry {
            key: key.to_string(),
            value: self.value.clone(),
            revision: self.revision,
            created_at_ms: self.created_at_ms,
            updated_at_ms: self.updated_at_ms,
            ttl: self.ttl_ms.map(Duration::from_millis),
        }
    }

    fn decode(bytes: &[u8]) -> StoreResult<Self> {
        serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
    }
}

/// Thread-safe coordination store backed by redb.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
    events: broadcast::Sender<WatchEvent>,
}

impl RedbStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Backend))?;
        let store = Self::from_database(db)?;
        debug!(?path, "coordination store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store.
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Backend))?;
        let store = Self::from_database(db)?;
        debug!("in-memory coordination store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> StoreResult<Self> {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        let store = Self {
            db: Arc::new(db),
            events,
        };
        store.ensure_tables()?;
        Ok(store)
    }

    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Backend))?;
        txn.open_table(ENTRIES).map_err(map_err!(Backend))?;
        txn.open_table(META).map_err(map_err!(Backend))?;
        txn.commit().map_err(map_err!(Backend))?;
        Ok(())
    }

    /// Last revision issued by this store.
    pub fn current_revision(&self) -> StoreResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Backend))?;
        let meta = txn.open_table(META).map_err(map_err!(Backend))?;
        let revision = meta
            .get(REVISION_KEY)
            .map_err(map_err!(Backend))?
            .map(|g| g.value())
            .unwrap_or(0);
        Ok(revision)
    }

    fn publish(&self, event: WatchEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    fn put_sync(&self, key: &str, value: Vec<u8>, options: &KvOptions) -> StoreResult<KvEntry> {
        options.validate()?;
        let now = epoch_millis();

        let txn = self.db.begin_write().map_err(map_err!(Backend))?;
        let stored = {
            let mut table = txn.open_table(ENTRIES).map_err(map_err!(Backend))?;
            let mut meta = txn.open_table(META).map_err(map_err!(Backend))?;

            let current = match table.get(key).map_err(map_err!(Backend))? {
                Some(guard) => {
                    let entry = StoredEntry::decode(guard.value())?;
                    (!entry.is_expired(now)).then_some(entry)
                }
                None => None,
            };

            if options.create_only && current.is_some() {
                return Err(StoreError::KeyExists(key.to_string()));
            }
            if options.update_only && current.is_none() {
                return Err(StoreError::KeyNotFound(key.to_string()));
            }
            if let Some(expected) = options.revision {
                let actual = current.as_ref().map(|c| c.revision);
                if actual != Some(expected) {
                    return Err(StoreError::RevisionMismatch {
                        key: key.to_string(),
                        expected,
                        actual,
                    });
                }
            }

            let last = meta
                .get(REVISION_KEY)
                .map_err(map_err!(Backend))?
                .map(|g| g.value())
                .unwrap_or(0);
            let revision = last + 1;
            meta.insert(REVISION_KEY, revision).map_err(map_err!(Backend))?;

            let ttl_ms = options.ttl.map(|t| t.as_millis() as u64);
            let stored = StoredEntry {
                value,
                revision,
                created_at_ms: current.as_ref().map(|c| c.created_at_ms).unwrap_or(now),
                updated_at_ms: now,
                ttl_ms,
                expires_at_ms: ttl_ms.map(|ttl| now + ttl),
            };
            let bytes = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Backend))?;
            stored
        };
        txn.commit().map_err(map_err!(Backend))?;

        Ok(stored.to_entry(key))
    }

    fn delete_sync(&self, key: &str) -> StoreResult<Option<(WatchOp, KvEntry)>> {
        let now = epoch_millis();
        let txn = self.db.begin_write().map_err(map_err!(Backend))?;
        let removed = {
            let mut table = txn.open_table(ENTRIES).map_err(map_err!(Backend))?;
            let removed = table.remove(key).map_err(map_err!(Backend))?;
            match removed {
                Some(guard) => Some(StoredEntry::decode(guard.value())?),
                None => None,
            }
        };
        txn.commit().map_err(map_err!(Backend))?;

        Ok(removed.map(|stored| {
            let op = if stored.is_expired(now) {
                WatchOp::Purge
            } else {
                WatchOp::Delete
            };
            (op, stored.to_entry(key))
        }))
    }

    /// Remove every expired entry and publish a `Purge` event for each.
    /// Returns the number of entries removed.
    pub fn purge_expired(&self) -> StoreResult<usize> {
        let now = epoch_millis();
        let txn = self.db.begin_write().map_err(map_err!(Backend))?;
        let purged = {
            let mut table = txn.open_table(ENTRIES).map_err(map_err!(Backend))?;
            let mut expired = Vec::new();
            for item in table.iter().map_err(map_err!(Backend))? {
                let (k, v) = item.map_err(map_err!(Backend))?;
                let stored = StoredEntry::decode(v.value())?;
                if stored.is_expired(now) {
                    expired.push((k.value().to_string(), stored));
                }
            }
            for (key, _) in &expired {
                table.remove(key.as_str()).map_err(map_err!(Backend))?;
            }
            expired
        };
        txn.commit().map_err(map_err!(Backend))?;

        let count = purged.len();
        for (key, stored) in purged {
            debug!(%key, "entry expired");
            let entry = stored.to_entry(&key);
            self.publish(WatchEvent {
                operation: WatchOp::Purge,
                key,
                entry: Some(entry),
            });
        }
        Ok(count)
    }

    /// Periodically purge expired entries until shutdown is signalled.
    pub async fn run_reaper(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        debug!(?interval, "ttl reaper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.purge_expired() {
                        Ok(0) => {}
                        Ok(purged) => debug!(purged, "expired entries purged"),
                        Err(e) => warn!(error = %e, "ttl reaper pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    debug!("ttl reaper shutting down");
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl CoordinationStore for RedbStore {
    async fn get(&self, key: &str) -> StoreResult<Option<KvEntry>> {
        let txn = self.db.begin_read().map_err(map_err!(Backend))?;
        let table = txn.open_table(ENTRIES).map_err(map_err!(Backend))?;
        match table.get(key).map_err(map_err!(Backend))? {
            Some(guard) => {
                let stored = StoredEntry::decode(guard.value())?;
                if stored.is_expired(epoch_millis()) {
                    Ok(None)
                } else {
                    Ok(Some(stored.to_entry(key)))
                }
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>, options: KvOptions) -> StoreResult<u64> {
        let entry = self.put_sync(key, value, &options)?;
        let revision = entry.revision;
        debug!(%key, revision, "entry stored");
        self.publish(WatchEvent {
            operation: WatchOp::Put,
            key: key.to_string(),
            entry: Some(entry),
        });
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let Some((operation, entry)) = self.delete_sync(key)? else {
            return Ok(false);
        };
        let existed = operation == WatchOp::Delete;
        debug!(%key, existed, "entry deleted");
        self.publish(WatchEvent {
            operation,
            key: key.to_string(),
            entry: Some(entry),
        });
        Ok(existed)
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<KvEntry>> {
        let now = epoch_millis();
        let txn = self.db.begin_read().map_err(map_err!(Backend))?;
        let table = txn.open_table(ENTRIES).map_err(map_err!(Backend))?;
        let mut results = Vec::new();
        for item in table.iter().map_err(map_err!(Backend))? {
            let (k, v) = item.map_err(map_err!(Backend))?;
            let key = k.value();
            if !key.starts_with(prefix) {
                continue;
            }
            let stored = StoredEntry::decode(v.value())?;
            if !stored.is_expired(now) {
                results.push(stored.to_entry(key));
            }
        }
        Ok(results)
    }

    async fn watch(&self, target: WatchTarget) -> StoreResult<WatchStream> {
        let rx = self.events.subscribe();
        let stream = futures::stream::unfold((rx, target), |(mut rx, target)| async move {
            loop {
                match rx.recv().await {
                    Ok(event) if target.matches(&event.key) => {
                        return Some((Ok(event), (rx, target)));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        return Some((Err(StoreError::WatchLagged(skipped)), (rx, target)));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
