//! The lease on one `(service, group)` leader key.
//!
//! Acquisition is a create-only put and renewal a revision-checked put, so
//! the store decides every race. Losing a race is a normal outcome and is
//! reported as `false`; only a failing store is an error.

use std::time::Duration;

use anchor_core::keys::leader_key;
use anchor_core::time::{epoch_millis, millis_since};
use anchor_store::{KvOptions, SharedStore, StoreError, WatchStream, WatchTarget};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ElectionError, ElectionResult};

/// Value stored under the leader key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub instance_id: String,
    pub acquired_at_ms: u64,
    pub renewed_at_ms: u64,
    pub ttl_ms: u64,
}

impl LeaseRecord {
    pub fn expires_at_ms(&self) -> u64 {
        self.renewed_at_ms.saturating_add(self.ttl_ms)
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.expires_at_ms()
    }
}

/// Liveness of the current leader as seen at one instant. Never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatStatus {
    pub instance_id: String,
    pub last_seen_ms: u64,
    pub ttl_seconds: f64,
    pub is_expired: bool,
    pub time_since_last: Duration,
}

impl HeartbeatStatus {
    pub fn from_lease(lease: &LeaseRecord, now_ms: u64) -> Self {
        Self {
            instance_id: lease.instance_id.clone(),
            last_seen_ms: lease.renewed_at_ms,
            ttl_seconds: lease.ttl_ms as f64 / 1000.0,
            is_expired: lease.is_expired(now_ms),
            time_since_last: millis_since(lease.renewed_at_ms, now_ms),
        }
    }
}

pub struct ElectionRepository {
    store: SharedStore,
    service_name: String,
    group_id: String,
    key: String,
}

impl ElectionRepository {
    pub fn new(store: SharedStore, service_name: &str, group_id: &str) -> Self {
        Self {
            store,
            service_name: service_name.to_string(),
            group_id: group_id.to_string(),
            key: leader_key(service_name, group_id),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Create the leader key for `instance_id`. `true` iff this call created it.
    pub async fn try_acquire(&self, instance_id: &str, ttl: Duration) -> ElectionResult<bool> {
        let now = epoch_millis();
        let lease = LeaseRecord {
            instance_id: instance_id.to_string(),
            acquired_at_ms: now,
            renewed_at_ms: now,
            ttl_ms: ttl.as_millis() as u64,
        };
        let value = encode(&lease)?;

        match self
            .store
            .put(&self.key, value, KvOptions::create_only().with_ttl(ttl))
            .await
        {
            Ok(revision) => {
                info!(
                    service = %self.service_name,
                    group = %self.group_id,
                    %instance_id,
                    revision,
                    "lease acquired"
                );
                Ok(true)
            }
            Err(StoreError::KeyExists(_)) => {
                debug!(key = %self.key, %instance_id, "lease already held");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Extend the lease if `instance_id` still owns it.
    ///
    /// `false` when the key is gone, owned by someone else, or changed
    /// between the read and the write.
    pub async fn renew(&self, instance_id: &str, ttl: Duration) -> ElectionResult<bool> {
        let Some((mut lease, revision)) = self.current_lease().await? else {
            debug!(key = %self.key, %instance_id, "renew found no lease");
            return Ok(false);
        };
        if lease.instance_id != instance_id {
            debug!(key = %self.key, %instance_id, owner = %lease.instance_id, "renew found another owner");
            return Ok(false);
        }

        lease.renewed_at_ms = epoch_millis();
        lease.ttl_ms = ttl.as_millis() as u64;
        let options = KvOptions::default().with_revision(revision).with_ttl(ttl);

        match self.store.put(&self.key, encode(&lease)?, options).await {
            Ok(_) => {
                debug!(key = %self.key, %instance_id, "lease renewed");
                Ok(true)
            }
            Err(e) if e.is_conflict() => {
                debug!(key = %self.key, %instance_id, error = %e, "lease changed during renew");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the lease if `instance_id` still owns it.
    ///
    /// The ownership check and the delete are separate store calls; a lease
    /// that expires and is re-acquired in between would be deleted too.
    pub async fn release(&self, instance_id: &str) -> ElectionResult<()> {
        match self.current_lease().await? {
            Some((lease, _)) if lease.instance_id == instance_id => {
                self.store.delete(&self.key).await?;
                info!(
                    service = %self.service_name,
                    group = %self.group_id,
                    %instance_id,
                    "lease released"
                );
            }
            Some((lease, _)) => {
                warn!(key = %self.key, %instance_id, owner = %lease.instance_id, "not releasing lease held by another instance");
            }
            None => {}
        }
        Ok(())
    }

    /// The stored lease and its revision.
    pub async fn current_lease(&self) -> ElectionResult<Option<(LeaseRecord, u64)>> {
        let Some(entry) = self.store.get(&self.key).await? else {
            return Ok(None);
        };
        let lease = serde_json::from_slice::<LeaseRecord>(&entry.value).map_err(|e| {
            ElectionError::CorruptLease {
                key: self.key.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(Some((lease, entry.revision)))
    }

    pub async fn heartbeat_status(&self, now_ms: u64) -> ElectionResult<Option<HeartbeatStatus>> {
        Ok(self
            .current_lease()
            .await?
            .map(|(lease, _)| HeartbeatStatus::from_lease(&lease, now_ms)))
    }

    /// Subscribe to changes of the leader key.
    pub async fn watch(&self) -> ElectionResult<WatchStream> {
        Ok(self.store.watch(WatchTarget::Key(self.key.clone())).await?)
    }
}

fn encode(lease: &LeaseRecord) -> ElectionResult<Vec<u8>> {
    serde_json::to_vec(lease).map_err(|e| StoreError::Serialize(e.to_string()).into())
}
