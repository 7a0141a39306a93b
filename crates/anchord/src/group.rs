//! N peers of one sticky-active group sharing a process.
//!
//! Every peer gets its own `SingleActiveService` but all of them talk to
//! the same redb database through a `TimedStore`, so elections, registry
//! heartbeats and discovery behave as they would across processes.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anchor_core::{AnchorConfig, RetryPolicy, ServiceInstance};
use anchor_election::{Health, ServiceConfig, ServiceState, SingleActiveService};
use anchor_metrics::{MetricsCollector, MetricsSink};
use anchor_registry::{BasicDiscovery, CachedDiscovery, ServiceDiscovery, ServiceRegistry, WatchableCachedDiscovery};
use anchor_rpc::{CallTarget, HandlerRegistry, LocalTransport, ResilientCaller, RpcResult, handler};
use anchor_store::{RedbStore, SharedStore, TimedStore};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct PeerGroup {
    config: AnchorConfig,
    store: RedbStore,
    metrics: Arc<MetricsCollector>,
    registry: Arc<ServiceRegistry>,
    discovery: Arc<CachedDiscovery>,
    watcher: Option<WatchableCachedDiscovery>,
    transport: Arc<LocalTransport>,
    caller: ResilientCaller,
    retry: RetryPolicy,
    peers: Vec<Arc<SingleActiveService>>,
}

#[derive(Debug, Serialize)]
pub struct PeerStatus {
    pub instance_id: String,
    pub state: ServiceState,
    pub health: Health,
}

#[derive(Debug, Serialize)]
pub struct GroupStatus {
    pub service: String,
    pub group: String,
    pub leader: Option<String>,
    pub peers: Vec<PeerStatus>,
    pub registry: Vec<ServiceInstance>,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl PeerGroup {
    /// Open the store and assemble `peers` services. Nothing runs until
    /// [`PeerGroup::start`].
    pub fn build(config: AnchorConfig, peers: usize, data_dir: Option<&Path>) -> anyhow::Result<Self> {
        let store = open_store(&config, data_dir)?;
        let shared: SharedStore = Arc::new(TimedStore::new(store.clone(), config.store_op_timeout()?));

        let metrics = Arc::new(MetricsCollector::new());
        let registry = Arc::new(ServiceRegistry::new(
            shared.clone(),
            metrics.clone(),
            config.staleness_threshold()?,
        ));

        let discovery = Arc::new(CachedDiscovery::new(
            BasicDiscovery::new(registry.clone()),
            config.cache_ttl()?,
            metrics.clone(),
        ));
        let watcher = config
            .discovery_watch()
            .then(|| WatchableCachedDiscovery::new(discovery.clone(), shared.clone()));

        let handlers = Arc::new(HandlerRegistry::new());
        register_handlers(&handlers);

        let transport = Arc::new(LocalTransport::new());
        let caller = ResilientCaller::new(transport.clone(), metrics.clone(), config.call_timeout()?);
        let retry = config.retry_policy()?;

        let mut services = Vec::with_capacity(peers);
        for n in 1..=peers {
            let instance_id = instance_id_for(&config, n, peers);
            let service_config = ServiceConfig::from_anchor_config(&config, &instance_id)?;
            let service = Arc::new(SingleActiveService::new(
                service_config,
                shared.clone(),
                registry.clone(),
                handlers.clone(),
            ));
            transport.register(service.clone());
            services.push(service);
        }

        Ok(Self {
            config,
            store,
            metrics,
            registry,
            discovery,
            watcher,
            transport,
            caller,
            retry,
            peers: services,
        })
    }

    pub fn service_name(&self) -> &str {
        &self.config.instance.service_name
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Spawn the store reaper and the registry sweeper, start discovery
    /// invalidation, then start every peer.
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let reaper = tokio::spawn(
            self.store
                .clone()
                .run_reaper(self.config.reap_interval()?, shutdown.clone()),
        );
        let sweeper = tokio::spawn(run_sweeper(
            self.registry.clone(),
            self.config.staleness_threshold()?,
            shutdown,
        ));

        if let Some(watcher) = &self.watcher {
            watcher.start();
        }

        for peer in &self.peers {
            peer.start().await?;
        }
        info!(
            service = %self.service_name(),
            group = %self.config.instance.group_id,
            peers = self.peers.len(),
            "peer group started"
        );
        Ok(vec![reaper, sweeper])
    }

    /// Call `method` on the group. Without `instance_id` the call goes to any
    /// peer and rides out a failover through the retry policy.
    pub async fn call(&self, method: &str, params: Value, instance_id: Option<&str>) -> RpcResult<Value> {
        let target = match instance_id {
            Some(id) => CallTarget::Instance {
                service: self.service_name().to_string(),
                instance_id: id.to_string(),
            },
            None => CallTarget::Service(self.service_name().to_string()),
        };
        self.caller.call(&target, method, params, &self.retry).await
    }

    /// Stop one peer. `None` if no peer has that id.
    pub async fn stop_peer(&self, instance_id: &str) -> Option<anyhow::Result<()>> {
        let peer = self.peers.iter().find(|p| p.instance_id() == instance_id)?;
        self.transport.unregister(self.service_name(), instance_id);
        Some(peer.stop().await.map_err(Into::into))
    }

    pub async fn status(&self) -> GroupStatus {
        let peers: Vec<_> = self
            .peers
            .iter()
            .map(|p| PeerStatus {
                instance_id: p.instance_id().to_string(),
                state: p.state(),
                health: p.health(),
            })
            .collect();
        let active = peers.iter().filter(|p| p.state == ServiceState::Active).count();
        self.metrics.set_gauge("group.active_peers", active as f64);

        let leader = match self.peers.first() {
            Some(peer) => peer.current_leader().await.unwrap_or_else(|e| {
                warn!(error = %e, "failed to read leader lease");
                None
            }),
            None => None,
        };
        let registry = self.discovery.discover_instances(self.service_name(), false).await;
        let stats = self.discovery.stats();

        GroupStatus {
            service: self.service_name().to_string(),
            group: self.config.instance.group_id.clone(),
            leader,
            peers,
            registry,
            cache_hits: stats.hits,
            cache_misses: stats.misses,
        }
    }

    /// Stop discovery and every peer.
    pub async fn shutdown(&self) {
        if let Some(watcher) = &self.watcher {
            watcher.stop().await;
        }
        for peer in &self.peers {
            if let Err(e) = peer.stop().await {
                warn!(instance_id = %peer.instance_id(), error = %e, "peer did not stop cleanly");
            }
        }
        debug!(revision = ?self.store.current_revision().ok(), "peer group stopped");
    }
}

fn open_store(config: &AnchorConfig, data_dir: Option<&Path>) -> anyhow::Result<RedbStore> {
    let store = match (data_dir, config.store.path.as_deref()) {
        (Some(dir), _) => {
            std::fs::create_dir_all(dir)?;
            let path = dir.join("anchor.redb");
            info!(path = ?path, "opening coordination store");
            RedbStore::open(&path)?
        }
        (None, Some(path)) => {
            info!(%path, "opening coordination store");
            RedbStore::open(Path::new(path))?
        }
        (None, None) => {
            info!("using in-memory coordination store");
            RedbStore::open_in_memory()?
        }
    };
    Ok(store)
}

fn instance_id_for(config: &AnchorConfig, n: usize, peers: usize) -> String {
    match &config.instance.instance_id {
        Some(id) if peers == 1 => id.clone(),
        Some(id) => format!("{id}-{n}"),
        None => format!("{}-{n}", config.instance.service_name),
    }
}

/// Demo methods: `sequence.next` hands out numbers from the leader only,
/// `echo` answers anywhere.
fn register_handlers(handlers: &HandlerRegistry) {
    let sequence = Arc::new(AtomicU64::new(0));
    handlers.register_exclusive(
        "sequence.next",
        handler(move |_| {
            let sequence = sequence.clone();
            async move { Ok(json!(sequence.fetch_add(1, Ordering::SeqCst) + 1)) }
        }),
    );
    handlers.register_ordinary("echo", handler(|params| async move { Ok(params) }));
}

async fn run_sweeper(registry: Arc<ServiceRegistry>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => match registry.sweep_stale().await {
                Ok(swept) if !swept.is_empty() => info!(count = swept.len(), "stale registry records flagged"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "registry sweep failed"),
            },
            _ = shutdown.changed() => {
                debug!("registry sweeper shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> AnchorConfig {
        AnchorConfig::parse(
            r#"
            [instance]
            service_name = "ledger"
            group_id = "primary"

            [election]
            lease_ttl = "600ms"
            renew_interval = "200ms"
            monitor_interval = "100ms"
            grace_delay = "50ms"
            shutdown_grace = "500ms"

            [registry]
            ttl = "5s"

            [rpc]
            initial_delay = "20ms"
            max_delay = "100ms"
            max_retries = 30
            "#,
        )
        .unwrap()
    }

    #[test]
    fn instance_ids() {
        let mut config = fast_config();
        assert_eq!(instance_id_for(&config, 2, 3), "ledger-2");
        config.instance.instance_id = Some("edge".into());
        assert_eq!(instance_id_for(&config, 1, 1), "edge");
        assert_eq!(instance_id_for(&config, 3, 3), "edge-3");
    }

    #[tokio::test]
    async fn group_elects_one_leader_and_serves_calls() {
        let group = PeerGroup::build(fast_config(), 3, None).unwrap();
        let (tx, rx) = watch::channel(false);
        let tasks = group.start(rx).await.unwrap();

        let status = group.status().await;
        assert_eq!(status.peers.len(), 3);
        let active: Vec<_> = status
            .peers
            .iter()
            .filter(|p| p.state == ServiceState::Active)
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(status.leader.as_deref(), Some(active[0].instance_id.as_str()));
        assert_eq!(status.registry.len(), 3);

        assert_eq!(group.call("sequence.next", json!(null), None).await.unwrap(), json!(1));
        assert_eq!(group.call("sequence.next", json!(null), None).await.unwrap(), json!(2));
        assert_eq!(group.call("echo", json!("hi"), None).await.unwrap(), json!("hi"));

        group.shutdown().await;
        tx.send(true).unwrap();
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn stopping_the_leader_moves_exclusive_calls() {
        let group = PeerGroup::build(fast_config(), 2, None).unwrap();
        let (tx, rx) = watch::channel(false);
        let _tasks = group.start(rx).await.unwrap();

        let leader = group.status().await.leader.unwrap();
        group.stop_peer(&leader).await.unwrap().unwrap();
        assert!(group.stop_peer("nope").await.is_none());

        group.call("sequence.next", json!(null), None).await.unwrap();
        let status = group.status().await;
        let new_leader = status.leader.unwrap();
        assert_ne!(new_leader, leader);

        group.shutdown().await;
        tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn data_dir_store_is_persistent() {
        let dir = tempfile::tempdir().unwrap();
        let group = PeerGroup::build(fast_config(), 1, Some(dir.path())).unwrap();
        assert!(dir.path().join("anchor.redb").exists());
        drop(group);
    }
}
