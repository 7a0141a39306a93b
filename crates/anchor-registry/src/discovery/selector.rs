//! Instance selection strategies.
//!
//! Round-robin keeps one atomic counter per service name, owned by the
//! selector (and so by the discovery instance that holds it). The index is
//! taken modulo the current pool size, so the rotation adapts when the
//! pool grows or shrinks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use anchor_core::ServiceInstance;
use rand::Rng;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SelectionStrategy {
    #[default]
    RoundRobin,
    Random,
    /// The preferred instance when present, otherwise the first listed.
    Sticky,
}

#[derive(Default)]
pub struct InstanceSelector {
    counters: RwLock<HashMap<String, Arc<AtomicUsize>>>,
}

impl InstanceSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick one of `instances`. Returns `None` for an empty pool.
    pub fn select(
        &self,
        service: &str,
        instances: &[ServiceInstance],
        strategy: SelectionStrategy,
        preferred_instance_id: Option<&str>,
    ) -> Option<ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        let idx = match strategy {
            SelectionStrategy::RoundRobin => self.next_index(service, instances.len()),
            SelectionStrategy::Random => rand::rng().random_range(0..instances.len()),
            SelectionStrategy::Sticky => preferred_instance_id
                .and_then(|id| instances.iter().position(|i| i.instance_id == id))
                .unwrap_or(0),
        };
        instances.get(idx).cloned()
    }

    /// Forget the rotation position of one service.
    pub fn reset(&self, service: &str) {
        self.counters.write().unwrap().remove(service);
    }

    fn next_index(&self, service: &str, count: usize) -> usize {
        let counter = {
            let counters = self.counters.read().unwrap();
            counters.get(service).cloned()
        };
        let counter = match counter {
            Some(c) => c,
            None => self
                .counters
                .write()
                .unwrap()
                .entry(service.to_string())
                .or_default()
                .clone(),
        };
        counter.fetch_add(1, Ordering::Relaxed) % count
    }
}

/// Keep only instances flagged as the leader of their group.
pub fn leaders_only(instances: Vec<ServiceInstance>) -> Vec<ServiceInstance> {
    instances.into_iter().filter(|i| i.is_leader()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anchor_core::LEADER_FLAG;

    fn pool(ids: &[&str]) -> Vec<ServiceInstance> {
        ids.iter()
            .map(|id| ServiceInstance::new("orders", id, "1.0.0"))
            .collect()
    }

    fn pick(selector: &InstanceSelector, instances: &[ServiceInstance], strategy: SelectionStrategy) -> String {
        selector
            .select("orders", instances, strategy, None)
            .unwrap()
            .instance_id
    }

    #[test]
    fn round_robin_alternates() {
        let selector = InstanceSelector::new();
        let instances = pool(&["a", "b"]);
        let picks: Vec<_> = (0..4)
            .map(|_| pick(&selector, &instances, SelectionStrategy::RoundRobin))
            .collect();
        assert_eq!(picks, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn round_robin_counters_are_per_service() {
        let selector = InstanceSelector::new();
        let instances = pool(&["a", "b"]);
        assert_eq!(pick(&selector, &instances, SelectionStrategy::RoundRobin), "a");
        let other = selector
            .select("billing", &instances, SelectionStrategy::RoundRobin, None)
            .unwrap();
        assert_eq!(other.instance_id, "a");
        assert_eq!(pick(&selector, &instances, SelectionStrategy::RoundRobin), "b");
    }

    #[test]
    fn round_robin_adapts_to_shrinking_pool() {
        let selector = InstanceSelector::new();
        let three = pool(&["a", "b", "c"]);
        assert_eq!(pick(&selector, &three, SelectionStrategy::RoundRobin), "a");
        assert_eq!(pick(&selector, &three, SelectionStrategy::RoundRobin), "b");
        let one = pool(&["c"]);
        assert_eq!(pick(&selector, &one, SelectionStrategy::RoundRobin), "c");

        selector.reset("orders");
        assert_eq!(pick(&selector, &three, SelectionStrategy::RoundRobin), "a");
    }

    #[test]
    fn sticky_prefers_then_falls_back_to_first() {
        let selector = InstanceSelector::new();
        let instances = pool(&["a", "b", "c"]);
        let hit = selector
            .select("orders", &instances, SelectionStrategy::Sticky, Some("c"))
            .unwrap();
        assert_eq!(hit.instance_id, "c");

        let miss = selector
            .select("orders", &instances, SelectionStrategy::Sticky, Some("gone"))
            .unwrap();
        assert_eq!(miss.instance_id, "a");
    }

    #[test]
    fn random_stays_in_pool() {
        let selector = InstanceSelector::new();
        let instances = pool(&["a", "b", "c"]);
        for _ in 0..50 {
            let id = pick(&selector, &instances, SelectionStrategy::Random);
            assert!(["a", "b", "c"].contains(&id.as_str()));
        }
    }

    #[test]
    fn empty_pool_selects_nothing() {
        let selector = InstanceSelector::new();
        for strategy in [SelectionStrategy::RoundRobin, SelectionStrategy::Random, SelectionStrategy::Sticky] {
            assert!(selector.select("orders", &[], strategy, Some("a")).is_none());
        }
    }

    #[test]
    fn leaders_only_filters_flag() {
        let mut instances = pool(&["a", "b"]);
        instances[1] = instances[1].clone().with_metadata(LEADER_FLAG, "true");
        instances[0] = instances[0].clone().with_metadata(LEADER_FLAG, "false");
        let leaders = leaders_only(instances);
        assert_eq!(leaders.len(), 1);
        assert_eq!(leaders[0].instance_id, "b");
    }
}
