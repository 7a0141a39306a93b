//! Service discovery over the registry.

mod basic;
mod cached;
mod selector;
mod watchable;

use anchor_core::ServiceInstance;
use async_trait::async_trait;

pub use basic::BasicDiscovery;
pub use cached::{CacheStats, CachedDiscovery};
pub use selector::{InstanceSelector, SelectionStrategy, leaders_only};
pub use watchable::WatchableCachedDiscovery;

/// Find instances of a service and pick one to call.
///
/// Discovery never fails: when the registry cannot be read it logs and
/// reports no instances.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    async fn discover_instances(&self, service: &str, only_healthy: bool) -> Vec<ServiceInstance>;

    /// Pick one healthy instance with `strategy`. `preferred_instance_id`
    /// is only consulted by [`SelectionStrategy::Sticky`].
    async fn select_instance(
        &self,
        service: &str,
        strategy: SelectionStrategy,
        preferred_instance_id: Option<&str>,
    ) -> Option<ServiceInstance>;
}

pub(crate) fn filter_healthy(instances: Vec<ServiceInstance>, only_healthy: bool) -> Vec<ServiceInstance> {
    if !only_healthy {
        return instances;
    }
    instances.into_iter().filter(|i| i.status.is_healthy()).collect()
}
