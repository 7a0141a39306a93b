//! Value types exchanged through the coordination store port.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// A stored key with its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: Vec<u8>,
    /// Store-wide revision of the last write to this key.
    pub revision: u64,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub ttl: Option<Duration>,
}

impl KvEntry {
    /// Decode the value as JSON.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> StoreResult<T> {
        serde_json::from_slice(&self.value).map_err(|e| StoreError::Deserialize(format!("{}: {e}", self.key)))
    }
}

/// Write options for [`crate::CoordinationStore::put`].
///
/// `create_only` and `update_only` are mutually exclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvOptions {
    pub ttl: Option<Duration>,
    /// Fail unless the stored revision equals this value.
    pub revision: Option<u64>,
    pub create_only: bool,
    pub update_only: bool,
}

impl KvOptions {
    pub fn create_only() -> Self {
        Self {
            create_only: true,
            ..Self::default()
        }
    }

    pub fn update_only() -> Self {
        Self {
            update_only: true,
            ..Self::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_revision(mut self, revision: u64) -> Self {
        self.revision = Some(revision);
        self
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.create_only && self.update_only {
            return Err(StoreError::InvalidOptions(
                "create_only and update_only are mutually exclusive".to_string(),
            ));
        }
        if self.ttl.is_some_and(|t| t.is_zero()) {
            return Err(StoreError::InvalidOptions("ttl must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Kind of change carried by a watch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchOp {
    Put,
    Delete,
    /// Removed by TTL expiry.
    Purge,
}

/// A change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub operation: WatchOp,
    pub key: String,
    /// New entry for `Put`, previous entry for `Delete`/`Purge` when known.
    pub entry: Option<KvEntry>,
}

/// What a watch subscribes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchTarget {
    Key(String),
    Prefix(String),
}

impl WatchTarget {
    pub fn matches(&self, key: &str) -> bool {
        match self {
            WatchTarget::Key(k) => k == key,
            WatchTarget::Prefix(p) => key.starts_with(p.as_str()),
        }
    }
}
