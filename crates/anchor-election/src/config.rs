//! Per-instance settings for a [`SingleActiveService`](crate::SingleActiveService).

use std::collections::HashMap;
use std::time::Duration;

use anchor_core::keys::check_segment;
use anchor_core::{AnchorConfig, ConfigError, FailoverPolicy, FailoverTimings};

use crate::error::ElectionResult;
use crate::monitor::MonitorConfig;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub service_name: String,
    pub group_id: String,
    pub instance_id: String,
    pub version: String,
    pub timings: FailoverTimings,
    pub monitor: MonitorConfig,
    /// How long after issuing the last successful renewal an active instance
    /// keeps serving without another one. Must stay below the lease TTL.
    pub store_grace: Duration,
    /// Per-operation bound of the store the instance runs against.
    pub store_op_timeout: Duration,
    pub registry_ttl: Duration,
    pub registry_heartbeat_interval: Duration,
    pub shutdown_grace: Duration,
    pub metadata: HashMap<String, String>,
}

impl ServiceConfig {
    /// Balanced-policy defaults.
    pub fn new(service_name: &str, group_id: &str, instance_id: &str, version: &str) -> Self {
        let timings = FailoverPolicy::Balanced.timings();
        Self {
            service_name: service_name.to_string(),
            group_id: group_id.to_string(),
            instance_id: instance_id.to_string(),
            version: version.to_string(),
            timings,
            monitor: MonitorConfig::from_timings(&timings),
            store_grace: derive_store_grace(&timings, DEFAULT_STORE_OP_TIMEOUT),
            store_op_timeout: DEFAULT_STORE_OP_TIMEOUT,
            registry_ttl: Duration::from_secs(30),
            registry_heartbeat_interval: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
            metadata: HashMap::new(),
        }
    }

    pub fn from_anchor_config(config: &AnchorConfig, instance_id: &str) -> ElectionResult<Self> {
        let timings = config.election_timings()?;
        let monitor = MonitorConfig::from_timings(&timings)
            .with_max_consecutive_failures(config.max_monitor_failures());
        Ok(Self::new(
            &config.instance.service_name,
            &config.instance.group_id,
            instance_id,
            &config.instance.version,
        )
        .with_store_op_timeout(config.store_op_timeout()?)
        .with_timings(timings)
        .with_monitor(monitor)
        .with_registry(config.registry_ttl()?, config.registry_heartbeat_interval()?)
        .with_shutdown_grace(config.shutdown_grace()?))
    }

    /// Replace the election timings. Monitor cadence follows the new
    /// timings; fields still at their value derived from the old timings are
    /// re-derived, explicitly set ones are kept.
    pub fn with_timings(mut self, timings: FailoverTimings) -> Self {
        let old = self.timings;
        self.monitor.interval = timings.monitor_interval;
        self.monitor.grace_delay = timings.grace_delay;
        if self.monitor.episode_timeout == old.lease_ttl {
            self.monitor.episode_timeout = timings.lease_ttl;
        }
        if self.monitor.failure_backoff_max == old.lease_ttl {
            self.monitor.failure_backoff_max = timings.lease_ttl;
        }
        if self.store_grace == derive_store_grace(&old, self.store_op_timeout) {
            self.store_grace = derive_store_grace(&timings, self.store_op_timeout);
        }
        self.timings = timings;
        self
    }

    /// Set the store's per-operation timeout. A store grace still at its
    /// derived value is re-derived.
    pub fn with_store_op_timeout(mut self, timeout: Duration) -> Self {
        if self.store_grace == derive_store_grace(&self.timings, self.store_op_timeout) {
            self.store_grace = derive_store_grace(&self.timings, timeout);
        }
        self.store_op_timeout = timeout;
        self
    }

    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_store_grace(mut self, grace: Duration) -> Self {
        self.store_grace = grace;
        self
    }

    pub fn with_registry(mut self, ttl: Duration, heartbeat_interval: Duration) -> Self {
        self.registry_ttl = ttl;
        self.registry_heartbeat_interval = heartbeat_interval;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn validate(&self) -> ElectionResult<()> {
        self.timings.validate()?;
        check_segment("service_name", &self.service_name)?;
        check_segment("group_id", &self.group_id)?;
        check_segment("instance_id", &self.instance_id)?;
        if self.store_grace <= self.timings.renew_interval || self.store_grace >= self.timings.lease_ttl {
            return Err(ConfigError::Timings(format!(
                "store_grace {:?} must be in (renew_interval {:?}, lease_ttl {:?})",
                self.store_grace, self.timings.renew_interval, self.timings.lease_ttl
            ))
            .into());
        }
        if self.registry_heartbeat_interval.is_zero()
            || self.registry_heartbeat_interval >= self.registry_ttl
        {
            return Err(ConfigError::Timings(format!(
                "registry heartbeat_interval {:?} must be in (0, ttl {:?})",
                self.registry_heartbeat_interval, self.registry_ttl
            ))
            .into());
        }
        Ok(())
    }
}

const DEFAULT_STORE_OP_TIMEOUT: Duration = Duration::from_secs(2);

/// `lease_ttl - renew_interval - op_timeout`, but at least one and a half
/// renew intervals so a healthy leader always gets its renewal in.
fn derive_store_grace(timings: &FailoverTimings, op_timeout: Duration) -> Duration {
    let floor = timings.renew_interval + timings.renew_interval / 2;
    timings
        .lease_ttl
        .saturating_sub(timings.renew_interval)
        .saturating_sub(op_timeout)
        .max(floor)
}
