use std::sync::Arc;

use anchor_core::ServiceInstance;
use async_trait::async_trait;
use tracing::warn;

use super::{InstanceSelector, SelectionStrategy, ServiceDiscovery, filter_healthy};
use crate::error::RegistryResult;
use crate::registry::ServiceRegistry;

/// Discovery that scans the registry on every call.
pub struct BasicDiscovery {
    registry: Arc<ServiceRegistry>,
    selector: InstanceSelector,
}

impl BasicDiscovery {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            registry,
            selector: InstanceSelector::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Unfiltered registry view, with errors. Caching layers use this so
    /// that failures are not mistaken for an empty service.
    pub async fn fetch(&self, service: &str) -> RegistryResult<Vec<ServiceInstance>> {
        self.registry.list_instances(service).await
    }
}

#[async_trait]
impl ServiceDiscovery for BasicDiscovery {
    async fn discover_instances(&self, service: &str, only_healthy: bool) -> Vec<ServiceInstance> {
        match self.fetch(service).await {
            Ok(instances) => filter_healthy(instances, only_healthy),
            Err(e) => {
                warn!(%service, error = %e, "registry lookup failed");
                Vec::new()
            }
        }
    }

    async fn select_instance(
        &self,
        service: &str,
        strategy: SelectionStrategy,
        preferred_instance_id: Option<&str>,
    ) -> Option<ServiceInstance> {
        let instances = self.discover_instances(service, true).await;
        self.selector
            .select(service, &instances, strategy, preferred_instance_id)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use anchor_core::InstanceStatus;
    use anchor_metrics::NoopSink;
    use anchor_store::{FaultyStore, RedbStore};

    #[tokio::test]
    async fn filters_unhealthy_when_asked() {
        let store = Arc::new(RedbStore::open_in_memory().unwrap());
        let registry = Arc::new(ServiceRegistry::new(store, NoopSink::shared(), Duration::from_secs(30)));
        let ttl = Duration::from_secs(30);
        registry
            .register(&ServiceInstance::new("orders", "a", "1.0.0"), ttl)
            .await
            .unwrap();
        let mut down = ServiceInstance::new("orders", "b", "1.0.0");
        down.status = InstanceStatus::Unhealthy;
        registry.register(&down, ttl).await.unwrap();

        let discovery = BasicDiscovery::new(registry);
        assert_eq!(discovery.discover_instances("orders", false).await.len(), 2);
        let healthy = discovery.discover_instances("orders", true).await;
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].instance_id, "a");

        let picked = discovery
            .select_instance("orders", SelectionStrategy::RoundRobin, None)
            .await
            .unwrap();
        assert_eq!(picked.instance_id, "a");
    }

    #[tokio::test]
    async fn registry_failure_yields_empty_list() {
        let faulty = Arc::new(FaultyStore::new(RedbStore::open_in_memory().unwrap()));
        let registry = Arc::new(ServiceRegistry::new(
            faulty.clone(),
            NoopSink::shared(),
            Duration::from_secs(30),
        ));
        registry
            .register(&ServiceInstance::new("orders", "a", "1.0.0"), Duration::from_secs(30))
            .await
            .unwrap();

        let discovery = BasicDiscovery::new(registry);
        faulty.set_available(false);
        assert!(discovery.discover_instances("orders", true).await.is_empty());
        assert!(discovery.fetch("orders").await.is_err());
    }
}
