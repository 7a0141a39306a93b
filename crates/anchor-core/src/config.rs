//! anchor.toml configuration parser.
//!
//! Every section is optional; missing values fall back to the failover
//! policy preset or to the defaults documented on each accessor.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::policy::{FailoverPolicy, FailoverTimings};
use crate::retry::RetryPolicy;
use crate::time::parse_duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnchorConfig {
    #[serde(default)]
    pub instance: InstanceConfig,
    #[serde(default)]
    pub election: ElectionConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub service_name: String,
    pub group_id: String,
    /// Generated from the service name when absent.
    pub instance_id: Option<String>,
    pub version: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            service_name: "anchor".to_string(),
            group_id: "default".to_string(),
            instance_id: None,
            version: "0.1.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ElectionConfig {
    #[serde(default)]
    pub failover_policy: FailoverPolicy,
    pub lease_ttl: Option<String>,
    pub renew_interval: Option<String>,
    pub monitor_interval: Option<String>,
    pub grace_delay: Option<String>,
    pub max_monitor_failures: Option<u32>,
    pub shutdown_grace: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub ttl: Option<String>,
    pub heartbeat_interval: Option<String>,
    pub staleness_threshold: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub cache_ttl: Option<String>,
    pub watch: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpcConfig {
    pub call_timeout: Option<String>,
    pub max_retries: Option<u32>,
    pub initial_delay: Option<String>,
    pub backoff_multiplier: Option<f64>,
    pub max_delay: Option<String>,
    pub jitter_factor: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path of the redb file; in-memory when absent.
    pub path: Option<String>,
    pub op_timeout: Option<String>,
    pub reap_interval: Option<String>,
}

fn duration_or(value: &Option<String>, default: Duration) -> ConfigResult<Duration> {
    match value {
        Some(s) => parse_duration(s).ok_or_else(|| ConfigError::Duration(s.clone())),
        None => Ok(default),
    }
}

impl AnchorConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> ConfigResult<Self> {
        let config: AnchorConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Election timings: the policy preset with explicit overrides applied.
    pub fn election_timings(&self) -> ConfigResult<FailoverTimings> {
        let preset = self.election.failover_policy.timings();
        let timings = FailoverTimings {
            lease_ttl: duration_or(&self.election.lease_ttl, preset.lease_ttl)?,
            renew_interval: duration_or(&self.election.renew_interval, preset.renew_interval)?,
            monitor_interval: duration_or(&self.election.monitor_interval, preset.monitor_interval)?,
            grace_delay: duration_or(&self.election.grace_delay, preset.grace_delay)?,
        };
        timings.validate()?;
        Ok(timings)
    }

    /// Consecutive store failures before the heartbeat monitor gives up (default 3).
    pub fn max_monitor_failures(&self) -> u32 {
        self.election.max_monitor_failures.unwrap_or(3)
    }

    /// Time background loops get to exit before being aborted (default 5s).
    pub fn shutdown_grace(&self) -> ConfigResult<Duration> {
        duration_or(&self.election.shutdown_grace, Duration::from_secs(5))
    }

    /// Registry record TTL (default 30s).
    pub fn registry_ttl(&self) -> ConfigResult<Duration> {
        duration_or(&self.registry.ttl, Duration::from_secs(30))
    }

    /// Registry heartbeat cadence (default TTL/3).
    pub fn registry_heartbeat_interval(&self) -> ConfigResult<Duration> {
        let ttl = self.registry_ttl()?;
        duration_or(&self.registry.heartbeat_interval, ttl / 3)
    }

    /// Heartbeat age beyond which a record is flagged unhealthy (default TTL).
    pub fn staleness_threshold(&self) -> ConfigResult<Duration> {
        let ttl = self.registry_ttl()?;
        duration_or(&self.registry.staleness_threshold, ttl)
    }

    /// Discovery cache TTL (default 5s).
    pub fn cache_ttl(&self) -> ConfigResult<Duration> {
        duration_or(&self.discovery.cache_ttl, Duration::from_secs(5))
    }

    /// Whether discovery subscribes to registry changes (default true).
    pub fn discovery_watch(&self) -> bool {
        self.discovery.watch.unwrap_or(true)
    }

    /// Timeout per RPC attempt (default 5s).
    pub fn call_timeout(&self) -> ConfigResult<Duration> {
        duration_or(&self.rpc.call_timeout, Duration::from_secs(5))
    }

    /// Default retry policy for outgoing calls.
    pub fn retry_policy(&self) -> ConfigResult<RetryPolicy> {
        let defaults = RetryPolicy::default();
        let policy = RetryPolicy {
            max_retries: self.rpc.max_retries.unwrap_or(defaults.max_retries),
            initial_delay: duration_or(&self.rpc.initial_delay, defaults.initial_delay)?,
            backoff_multiplier: self
                .rpc
                .backoff_multiplier
                .unwrap_or(defaults.backoff_multiplier),
            max_delay: duration_or(&self.rpc.max_delay, defaults.max_delay)?,
            jitter_factor: self.rpc.jitter_factor.unwrap_or(defaults.jitter_factor),
            retryable_errors: defaults.retryable_errors,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Timeout per coordination-store operation (default 2s).
    pub fn store_op_timeout(&self) -> ConfigResult<Duration> {
        duration_or(&self.store.op_timeout, Duration::from_secs(2))
    }

    /// Interval of the store's expired-key reaper (default 1s).
    pub fn reap_interval(&self) -> ConfigResult<Duration> {
        duration_or(&self.store.reap_interval, Duration::from_secs(1))
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
