//! TTL-backed instance records in the coordination store.
//!
//! Each instance owns the record under `anchor/registry/{service}/{id}`.
//! Writes that depend on the stored record (heartbeats, status changes and
//! the staleness sweep) are revision-checked, so a sweep never overwrites a
//! heartbeat that landed between its read and its write.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use anchor_core::keys::{REGISTRY_ROOT, parse_registry_key, registry_key, registry_prefix};
use anchor_core::time::{epoch_millis, millis_since};
use anchor_core::{InstanceStatus, ServiceInstance};
use anchor_metrics::SharedSink;
use anchor_store::{KvEntry, KvOptions, SharedStore};
use tracing::{debug, info, warn};

use crate::error::{RegistryError, RegistryResult};

/// Read-modify-write attempts before reporting contention.
const MAX_WRITE_ATTEMPTS: usize = 5;

pub struct ServiceRegistry {
    store: SharedStore,
    metrics: SharedSink,
    staleness_threshold: Duration,
}

impl ServiceRegistry {
    pub fn new(store: SharedStore, metrics: SharedSink, staleness_threshold: Duration) -> Self {
        Self {
            store,
            metrics,
            staleness_threshold,
        }
    }

    pub fn staleness_threshold(&self) -> Duration {
        self.staleness_threshold
    }

    /// Write (or overwrite) the record for `instance` with the given TTL.
    pub async fn register(&self, instance: &ServiceInstance, ttl: Duration) -> RegistryResult<()> {
        instance.validate()?;
        let service = instance.service_name.as_str();
        let id = instance.instance_id.as_str();

        let now = epoch_millis();
        let record = self
            .modify(service, id, Some(ttl), |current| {
                let mut next = instance.clone();
                let stored = current.map(|c| c.last_heartbeat_ms).unwrap_or(0);
                next.last_heartbeat_ms = next.last_heartbeat_ms.max(stored).max(now);
                Some(next)
            })
            .await?;

        if let Some(record) = record {
            info!(
                %service,
                instance_id = %id,
                version = %record.version,
                status = ?record.status,
                "instance registered"
            );
        }
        Ok(())
    }

    /// Refresh the owner's record and its TTL.
    ///
    /// The stored heartbeat timestamp never decreases. An expired record is
    /// recreated from `instance`.
    pub async fn update_heartbeat(&self, instance: &ServiceInstance, ttl: Duration) -> RegistryResult<()> {
        let now = epoch_millis();
        let service = instance.service_name.as_str();
        let id = instance.instance_id.as_str();
        self.modify(service, id, Some(ttl), |current| {
            let mut next = instance.clone();
            let stored = current.map(|c| c.last_heartbeat_ms).unwrap_or(0);
            next.last_heartbeat_ms = stored.max(now);
            Some(next)
        })
        .await?;
        debug!(%service, instance_id = %id, "heartbeat written");
        Ok(())
    }

    /// Change the status of a registered instance and merge `metadata_patch`
    /// into its metadata. The record keeps its TTL.
    pub async fn update_status(
        &self,
        service: &str,
        instance_id: &str,
        status: InstanceStatus,
        metadata_patch: HashMap<String, String>,
    ) -> RegistryResult<ServiceInstance> {
        let updated = self
            .modify(service, instance_id, None, |current| {
                let mut next = current?;
                next.status = status;
                next.metadata
                    .extend(metadata_patch.iter().map(|(k, v)| (k.clone(), v.clone())));
                Some(next)
            })
            .await?;

        match updated {
            Some(record) => {
                info!(%service, %instance_id, ?status, "instance status updated");
                Ok(record)
            }
            None => Err(RegistryError::NotRegistered {
                service: service.to_string(),
                instance_id: instance_id.to_string(),
            }),
        }
    }

    /// Remove an instance record. Returns whether it existed.
    pub async fn deregister(&self, service: &str, instance_id: &str) -> RegistryResult<bool> {
        let existed = self.store.delete(&registry_key(service, instance_id)).await?;
        info!(%service, %instance_id, existed, "instance deregistered");
        Ok(existed)
    }

    /// A single record, with staleness applied.
    pub async fn get_instance(&self, service: &str, instance_id: &str) -> RegistryResult<Option<ServiceInstance>> {
        let entry = self.store.get(&registry_key(service, instance_id)).await?;
        let now = epoch_millis();
        Ok(entry
            .as_ref()
            .and_then(|e| self.decode(e))
            .map(|inst| self.flag_stale(inst, now)))
    }

    /// All records of one service. Records whose heartbeat is older than the
    /// staleness threshold are reported `Unhealthy`.
    pub async fn list_instances(&self, service: &str) -> RegistryResult<Vec<ServiceInstance>> {
        let entries = self.store.list(&registry_prefix(service)).await?;
        let now = epoch_millis();
        let instances: Vec<_> = entries
            .iter()
            .filter_map(|e| self.decode(e))
            .map(|inst| self.flag_stale(inst, now))
            .collect();
        self.metrics
            .set_gauge(&format!("registry.{service}.instances"), instances.len() as f64);
        Ok(instances)
    }

    /// Every registered service and its records, keyed by service name.
    pub async fn list_all_services(&self) -> RegistryResult<BTreeMap<String, Vec<ServiceInstance>>> {
        let entries = self.store.list(REGISTRY_ROOT).await?;
        let now = epoch_millis();
        let mut services: BTreeMap<String, Vec<ServiceInstance>> = BTreeMap::new();
        for entry in &entries {
            let Some((service, _)) = parse_registry_key(&entry.key) else {
                continue;
            };
            if let Some(inst) = self.decode(entry) {
                services
                    .entry(service.to_string())
                    .or_default()
                    .push(self.flag_stale(inst, now));
            }
        }
        for (service, instances) in &services {
            self.metrics
                .set_gauge(&format!("registry.{service}.instances"), instances.len() as f64);
        }
        Ok(services)
    }

    /// Persist `Unhealthy` for every stale record that is not already marked.
    /// Returns the ids of the records updated.
    pub async fn sweep_stale(&self) -> RegistryResult<Vec<String>> {
        let entries = self.store.list(REGISTRY_ROOT).await?;
        let now = epoch_millis();
        let mut swept = Vec::new();

        for entry in entries {
            let Some(mut inst) = self.decode(&entry) else {
                continue;
            };
            if !inst.status.is_healthy() || !self.is_stale(&inst, now) {
                continue;
            }
            inst.status = InstanceStatus::Unhealthy;
            let value = serde_json::to_vec(&inst).map_err(|e| RegistryError::Serialize(e.to_string()))?;
            let options = KvOptions {
                ttl: entry.ttl,
                revision: Some(entry.revision),
                ..KvOptions::default()
            };
            match self.store.put(&entry.key, value, options).await {
                Ok(_) => {
                    warn!(
                        service = %inst.service_name,
                        instance_id = %inst.instance_id,
                        last_heartbeat_ms = inst.last_heartbeat_ms,
                        "stale instance marked unhealthy"
                    );
                    swept.push(inst.instance_id);
                }
                Err(e) if e.is_conflict() => {
                    debug!(key = %entry.key, "record changed during sweep, skipped");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(swept)
    }

    fn is_stale(&self, instance: &ServiceInstance, now_ms: u64) -> bool {
        millis_since(instance.last_heartbeat_ms, now_ms) > self.staleness_threshold
    }

    fn flag_stale(&self, mut instance: ServiceInstance, now_ms: u64) -> ServiceInstance {
        if instance.status.is_healthy() && self.is_stale(&instance, now_ms) {
            instance.status = InstanceStatus::Unhealthy;
        }
        instance
    }

    fn decode(&self, entry: &KvEntry) -> Option<ServiceInstance> {
        match entry.decode::<ServiceInstance>() {
            Ok(inst) => Some(inst),
            Err(e) => {
                warn!(key = %entry.key, error = %e, "skipping unreadable registry record");
                None
            }
        }
    }

    /// Revision-checked read-modify-write of one record.
    ///
    /// `f` sees the stored record (if any) and returns the record to write,
    /// or `None` to leave the store untouched. `ttl = None` keeps the stored
    /// TTL.
    async fn modify<F>(
        &self,
        service: &str,
        instance_id: &str,
        ttl: Option<Duration>,
        mut f: F,
    ) -> RegistryResult<Option<ServiceInstance>>
    where
        F: FnMut(Option<ServiceInstance>) -> Option<ServiceInstance> + Send,
    {
        let key = registry_key(service, instance_id);

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let entry = self.store.get(&key).await?;
            let (current, revision, stored_ttl) = match &entry {
                Some(e) => (Some(e.decode::<ServiceInstance>()?), Some(e.revision), e.ttl),
                None => (None, None, None),
            };

            let Some(next) = f(current) else {
                return Ok(None);
            };

            let mut options = match revision {
                Some(rev) => KvOptions::default().with_revision(rev),
                None => KvOptions::create_only(),
            };
            options.ttl = ttl.or(stored_ttl);

            let value = serde_json::to_vec(&next).map_err(|e| RegistryError::Serialize(e.to_string()))?;
            match self.store.put(&key, value, options).await {
                Ok(_) => return Ok(Some(next)),
                Err(e) if e.is_conflict() => {
                    debug!(%key, "concurrent registry write, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(RegistryError::Contention(key))
    }
}
