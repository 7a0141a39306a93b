//! Domain types shared across Anchor crates.
//!
//! `ServiceInstance` is the registry record every peer keeps alive in the
//! coordination store. It is JSON-serialized into the store value.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Unique identifier for a service instance (peer).
pub type InstanceId = String;

/// Metadata flag carried by the current leader of a sticky-active group.
pub const LEADER_FLAG: &str = "is_leader";

// ── Instance ──────────────────────────────────────────────────────

/// Lifecycle status of a service instance as seen by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Holds the lease for its sticky-active group.
    Active,
    /// Alive and callable, not the leader.
    Standby,
    /// Missed heartbeats or lost the coordination store.
    Unhealthy,
    /// Deregistering after a graceful stop.
    Shutdown,
}

impl InstanceStatus {
    /// Whether discovery should hand this instance out to callers.
    pub fn is_healthy(self) -> bool {
        matches!(self, InstanceStatus::Active | InstanceStatus::Standby)
    }
}

/// Registry record for a single peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceInstance {
    pub service_name: String,
    pub instance_id: InstanceId,
    /// Semantic version of the running build.
    pub version: String,
    pub status: InstanceStatus,
    /// UTC unix milliseconds of the last heartbeat written by the owner.
    pub last_heartbeat_ms: u64,
    /// Group this instance competes in, if it runs the single-active pattern.
    #[serde(default)]
    pub sticky_active_group: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ServiceInstance {
    /// Create a new standby instance record with an empty metadata map.
    pub fn new(service_name: &str, instance_id: &str, version: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            instance_id: instance_id.to_string(),
            version: version.to_string(),
            status: InstanceStatus::Standby,
            last_heartbeat_ms: 0,
            sticky_active_group: None,
            metadata: HashMap::new(),
        }
    }

    /// Set the sticky-active group.
    pub fn with_group(mut self, group_id: &str) -> Self {
        self.sticky_active_group = Some(group_id.to_string());
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Whether the leader flag is set in metadata.
    pub fn is_leader(&self) -> bool {
        self.metadata.get(LEADER_FLAG).is_some_and(|v| v == "true")
    }

    /// Check the key-forming names and the version.
    pub fn validate(&self) -> ConfigResult<()> {
        crate::keys::check_segment("service_name", &self.service_name)?;
        crate::keys::check_segment("instance_id", &self.instance_id)?;
        if let Some(group) = &self.sticky_active_group {
            crate::keys::check_segment("group_id", group)?;
        }
        self.validate_version()
    }

    /// Check that `version` is a valid semantic version.
    pub fn validate_version(&self) -> ConfigResult<()> {
        semver::Version::parse(&self.version)
            .map(|_| ())
            .map_err(|e| ConfigError::Version {
                version: self.version.clone(),
                reason: e.to_string(),
            })
    }
}

// ── Error kinds ───────────────────────────────────────────────────

/// Tag for an RPC failure class, used to decide what a retry policy retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The receiving instance is not the active instance of its group.
    NotActive,
    Timeout,
    Transport,
    NoInstances,
    MethodNotFound,
    Handler,
    RetriesExhausted,
    /// The caller's retry policy failed validation; nothing was sent.
    InvalidPolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_nested_names() {
        assert!(ServiceInstance::new("orders", "orders-1", "1.0.0").validate().is_ok());
        assert!(ServiceInstance::new("orders/eu", "orders-1", "1.0.0").validate().is_err());
        assert!(ServiceInstance::new("orders", "a/b", "1.0.0").validate().is_err());
        assert!(
            ServiceInstance::new("orders", "orders-1", "1.0.0")
                .with_group("g/1")
                .validate()
                .is_err()
        );
        assert!(ServiceInstance::new("orders", "orders-1", "nope").validate().is_err());
    }

    #[test]
    fn new_instance_defaults_to_standby() {
        let inst = ServiceInstance::new("orders", "orders-1", "1.2.3");
        assert_eq!(inst.status, InstanceStatus::Standby);
        assert!(!inst.is_leader());
        assert!(inst.sticky_active_group.is_none());
    }

    #[test]
    fn leader_flag_read_from_metadata() {
        let inst = ServiceInstance::new("orders", "orders-1", "1.0.0").with_metadata(LEADER_FLAG, "true");
        assert!(inst.is_leader());
        let inst = inst.with_metadata(LEADER_FLAG, "false");
        assert!(!inst.is_leader());
    }

    #[test]
    fn version_must_be_semver() {
        assert!(ServiceInstance::new("a", "b", "0.3.1").validate_version().is_ok());
        assert!(ServiceInstance::new("a", "b", "1.0.0-rc.1").validate_version().is_ok());
        let err = ServiceInstance::new("a", "b", "latest").validate_version().unwrap_err();
        assert!(err.to_string().contains("latest"));
    }

    #[test]
    fn healthy_statuses() {
        assert!(InstanceStatus::Active.is_healthy());
        assert!(InstanceStatus::Standby.is_healthy());
        assert!(!InstanceStatus::Unhealthy.is_healthy());
        assert!(!InstanceStatus::Shutdown.is_healthy());
    }

    #[test]
    fn instance_json_roundtrip_keeps_optional_fields() {
        let inst = ServiceInstance::new("orders", "orders-1", "1.0.0").with_group("eu");
        let json = serde_json::to_string(&inst).unwrap();
        assert!(json.contains("\"status\":\"standby\""));
        let back: ServiceInstance = serde_json::from_str(&json).unwrap();
        assert_eq!(back, inst);
    }
}
