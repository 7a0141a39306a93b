//! Failover policy presets.
//!
//! A preset fixes the lease TTL, the renewal cadence, the heartbeat
//! monitor's poll interval, and the grace re-check delay. Individual values
//! can still be overridden from `anchor.toml`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Named trade-off between detection speed and store load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverPolicy {
    /// Sub-two-second detection, higher store traffic.
    Aggressive,
    #[default]
    Balanced,
    Conservative,
}

/// Concrete election timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverTimings {
    pub lease_ttl: Duration,
    /// Renewal cadence while active; must be strictly below `lease_ttl`.
    pub renew_interval: Duration,
    pub monitor_interval: Duration,
    /// Delay before re-checking an expired-looking lease.
    pub grace_delay: Duration,
}

impl FailoverPolicy {
    pub fn timings(self) -> FailoverTimings {
        match self {
            FailoverPolicy::Aggressive => FailoverTimings {
                lease_ttl: Duration::from_secs(3),
                renew_interval: Duration::from_secs(1),
                monitor_interval: Duration::from_millis(500),
                grace_delay: Duration::from_millis(250),
            },
            FailoverPolicy::Balanced => FailoverTimings {
                lease_ttl: Duration::from_secs(15),
                renew_interval: Duration::from_secs(5),
                monitor_interval: Duration::from_secs(2),
                grace_delay: Duration::from_secs(1),
            },
            FailoverPolicy::Conservative => FailoverTimings {
                lease_ttl: Duration::from_secs(30),
                renew_interval: Duration::from_secs(10),
                monitor_interval: Duration::from_secs(5),
                grace_delay: Duration::from_secs(2),
            },
        }
    }
}

impl FailoverTimings {
    /// Timings for a given TTL with the renewal cadence at TTL/3.
    pub fn from_ttl(lease_ttl: Duration) -> Self {
        Self {
            lease_ttl,
            renew_interval: lease_ttl / 3,
            monitor_interval: lease_ttl / 6,
            grace_delay: lease_ttl / 12,
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.lease_ttl.is_zero() {
            return Err(ConfigError::Timings("lease_ttl must be non-zero".to_string()));
        }
        if self.renew_interval.is_zero() || self.renew_interval >= self.lease_ttl {
            return Err(ConfigError::Timings(format!(
                "renew_interval {:?} must be in (0, lease_ttl {:?})",
                self.renew_interval, self.lease_ttl
            )));
        }
        if self.monitor_interval.is_zero() {
            return Err(ConfigError::Timings("monitor_interval must be non-zero".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_renew_well_inside_ttl() {
        for policy in [
            FailoverPolicy::Aggressive,
            FailoverPolicy::Balanced,
            FailoverPolicy::Conservative,
        ] {
            let t = policy.timings();
            assert!(t.validate().is_ok(), "{policy:?}");
            assert!(t.renew_interval * 3 <= t.lease_ttl, "{policy:?}");
            assert!(t.grace_delay < t.monitor_interval, "{policy:?}");
        }
    }

    #[test]
    fn aggressive_detects_within_two_seconds() {
        let t = FailoverPolicy::Aggressive.timings();
        assert!(t.monitor_interval + t.grace_delay < Duration::from_secs(2));
    }

    #[test]
    fn renew_interval_must_be_below_ttl() {
        let mut t = FailoverTimings::from_ttl(Duration::from_secs(9));
        assert_eq!(t.renew_interval, Duration::from_secs(3));
        t.renew_interval = Duration::from_secs(9);
        assert!(t.validate().is_err());
    }

    #[test]
    fn policy_parses_from_snake_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: FailoverPolicy,
        }
        let w: Wrapper = toml::from_str("policy = \"aggressive\"").unwrap();
        assert_eq!(w.policy, FailoverPolicy::Aggressive);
    }
}
