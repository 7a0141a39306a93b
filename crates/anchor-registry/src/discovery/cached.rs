//! TTL cache over [`BasicDiscovery`].
//!
//! # Concurrency
//!
//! Cache state sits behind a `std::sync::Mutex` held only for map lookups
//! and inserts; the registry scan runs outside it. Misses for one service
//! are serialized on a per-service async gate and re-check the cache once
//! inside it, so concurrent misses share a single registry hit.
//!
//! Every invalidation bumps a generation. A fetch that started before an
//! invalidation does not store its (possibly stale) result.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anchor_core::ServiceInstance;
use anchor_metrics::SharedSink;
use async_trait::async_trait;
use tracing::{debug, warn};

use super::{BasicDiscovery, InstanceSelector, SelectionStrategy, ServiceDiscovery, filter_healthy};

struct CacheEntry {
    instances: Vec<ServiceInstance>,
    inserted_at: Instant,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Bumped by a per-service invalidation.
    generations: HashMap<String, u64>,
    /// Bumped by a full invalidation.
    epoch: u64,
}

impl CacheState {
    fn generation(&self, service: &str) -> (u64, u64) {
        (self.epoch, self.generations.get(service).copied().unwrap_or(0))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

pub struct CachedDiscovery {
    inner: BasicDiscovery,
    ttl: Duration,
    state: Mutex<CacheState>,
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    selector: InstanceSelector,
    metrics: SharedSink,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CachedDiscovery {
    pub fn new(inner: BasicDiscovery, ttl: Duration, metrics: SharedSink) -> Self {
        Self {
            inner,
            ttl,
            state: Mutex::new(CacheState::default()),
            gates: Mutex::new(HashMap::new()),
            selector: InstanceSelector::new(),
            metrics,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Drop the cached view of one service, or of every service.
    pub fn invalidate_cache(&self, service: Option<&str>) {
        let mut state = self.state.lock().unwrap();
        match service {
            Some(service) => {
                state.entries.remove(service);
                *state.generations.entry(service.to_string()).or_insert(0) += 1;
                debug!(%service, "discovery cache invalidated");
            }
            None => {
                state.entries.clear();
                state.epoch += 1;
                debug!("discovery cache cleared");
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub fn cached_services(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .entries
            .iter()
            .filter(|(_, e)| e.inserted_at.elapsed() < self.ttl)
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn lookup(&self, service: &str) -> Option<Vec<ServiceInstance>> {
        let mut state = self.state.lock().unwrap();
        let expired = match state.entries.get(service) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                return Some(entry.instances.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            state.entries.remove(service);
        }
        None
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.metrics.incr_counter("discovery.cache.hit", 1);
    }

    fn gate(&self, service: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.gates.lock().unwrap();
        gates.entry(service.to_string()).or_default().clone()
    }

    /// All instances of `service`, healthy or not.
    async fn instances(&self, service: &str) -> Vec<ServiceInstance> {
        if let Some(hit) = self.lookup(service) {
            self.record_hit();
            return hit;
        }

        let gate = self.gate(service);
        let _guard = gate.lock().await;

        if let Some(hit) = self.lookup(service) {
            self.record_hit();
            return hit;
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        self.metrics.incr_counter("discovery.cache.miss", 1);

        let generation = self.state.lock().unwrap().generation(service);
        match self.inner.fetch(service).await {
            Ok(instances) => {
                let mut state = self.state.lock().unwrap();
                if state.generation(service) == generation {
                    state.entries.insert(
                        service.to_string(),
                        CacheEntry {
                            instances: instances.clone(),
                            inserted_at: Instant::now(),
                        },
                    );
                } else {
                    debug!(%service, "discarding fetch that raced an invalidation");
                }
                instances
            }
            Err(e) => {
                warn!(%service, error = %e, "registry lookup failed, not caching");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl ServiceDiscovery for CachedDiscovery {
    async fn discover_instances(&self, service: &str, only_healthy: bool) -> Vec<ServiceInstance> {
        filter_healthy(self.instances(service).await, only_healthy)
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
    use super::*;
    use crate::ServiceRegistry;
    use anchor_metrics::{MetricsCollector, NoopSink};
    use anchor_store::{FaultyStore, RedbStore};

    const RECORD_TTL: Duration = Duration::from_secs(30);

    struct Fixture {
        store: Arc<FaultyStore<RedbStore>>,
        registry: Arc<ServiceRegistry>,
        metrics: Arc<MetricsCollector>,
        cache: Arc<CachedDiscovery>,
    }

    fn fixture(ttl: Duration) -> Fixture {
        let store = Arc::new(FaultyStore::new(RedbStore::open_in_memory().unwrap()));
        let registry = Arc::new(ServiceRegistry::new(
            store.clone(),
            NoopSink::shared(),
            Duration::from_secs(30),
        ));
        let metrics = Arc::new(MetricsCollector::new());
        let cache = Arc::new(CachedDiscovery::new(
            BasicDiscovery::new(registry.clone()),
            ttl,
            metrics.clone(),
        ));
        Fixture {
            store,
            registry,
            metrics,
            cache,
        }
    }

    async fn register(registry: &ServiceRegistry, id: &str) {
        registry
            .register(&ServiceInstance::new("orders", id, "1.0.0"), RECORD_TTL)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn serves_from_cache_until_invalidated() {
        let f = fixture(Duration::from_secs(60));
        register(&f.registry, "a").await;

        assert_eq!(f.cache.discover_instances("orders", true).await.len(), 1);
        register(&f.registry, "b").await;
        // Still the cached view.
        assert_eq!(f.cache.discover_instances("orders", true).await.len(), 1);
        assert_eq!(f.cache.stats(), CacheStats { hits: 1, misses: 1 });

        f.cache.invalidate_cache(Some("orders"));
        assert_eq!(f.cache.discover_instances("orders", true).await.len(), 2);
        assert_eq!(f.metrics.counter("discovery.cache.miss"), 2);
        assert_eq!(f.metrics.counter("discovery.cache.hit"), 1);
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let f = fixture(Duration::from_millis(30));
        register(&f.registry, "a").await;
        f.cache.discover_instances("orders", true).await;
        register(&f.registry, "b").await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(f.cache.discover_instances("orders", true).await.len(), 2);
        assert_eq!(f.cache.stats().misses, 2);
    }

    #[tokio::test]
    async fn full_invalidation_clears_everything() {
        let f = fixture(Duration::from_secs(60));
        register(&f.registry, "a").await;
        f.cache.discover_instances("orders", true).await;
        f.cache.discover_instances("billing", true).await;
        assert_eq!(f.cache.cached_services().len(), 2);

        f.cache.invalidate_cache(None);
        assert!(f.cache.cached_services().is_empty());
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_fetch() {
        let f = fixture(Duration::from_secs(60));
        register(&f.registry, "a").await;
        f.store.set_latency(Some(Duration::from_millis(50)));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = f.cache.clone();
            handles.push(tokio::spawn(async move {
                cache.discover_instances("orders", true).await.len()
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), 1);
        }
        assert_eq!(f.cache.stats(), CacheStats { hits: 7, misses: 1 });
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let f = fixture(Duration::from_secs(60));
        register(&f.registry, "a").await;

        f.store.set_available(false);
        assert!(f.cache.discover_instances("orders", true).await.is_empty());
        assert!(f.cache.cached_services().is_empty());

        f.store.set_available(true);
        assert_eq!(f.cache.discover_instances("orders", true).await.len(), 1);
    }

    #[tokio::test]
    async fn fetch_racing_invalidation_is_discarded() {
        let f = fixture(Duration::from_secs(60));
        register(&f.registry, "a").await;
        f.store.set_latency(Some(Duration::from_millis(50)));

        let cache = f.cache.clone();
        let pending = tokio::spawn(async move { cache.discover_instances("orders", true).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        f.cache.invalidate_cache(Some("orders"));

        assert_eq!(pending.await.unwrap().len(), 1);
        assert!(f.cache.cached_services().is_empty());
    }
}
