//! Cached discovery kept fresh by a registry-prefix watch.
//!
//! A registry change invalidates the affected service. Establishing or
//! losing the subscription invalidates everything, since changes in the gap
//! were never seen. Reads go straight to the
//! cache and never wait on the watch. If the watch is abandoned the cache
//! keeps working on its TTL alone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anchor_core::ServiceInstance;
use anchor_core::keys::{REGISTRY_ROOT, parse_registry_key};
use anchor_store::{ReconnectConfig, ReconnectingWatch, SharedStore, WatchNotice, WatchTarget};
use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{CachedDiscovery, SelectionStrategy, ServiceDiscovery};

const STOP_GRACE: Duration = Duration::from_secs(1);

pub struct WatchableCachedDiscovery {
    cache: Arc<CachedDiscovery>,
    store: SharedStore,
    reconnect: ReconnectConfig,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    watching: Arc<AtomicBool>,
}

impl WatchableCachedDiscovery {
    pub fn new(cache: Arc<CachedDiscovery>, store: SharedStore) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            cache,
            store,
            reconnect: ReconnectConfig::default(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            watching: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_reconnect(mut self, config: ReconnectConfig) -> Self {
        self.reconnect = config;
        self
    }

    pub fn cache(&self) -> &Arc<CachedDiscovery> {
        &self.cache
    }

    /// Whether the registry watch is currently delivering notices.
    pub fn is_watching(&self) -> bool {
        self.watching.load(Ordering::SeqCst)
    }

    /// Subscribe to the registry prefix. Calling it again while running is a
    /// no-op.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        if !tasks.is_empty() {
            return;
        }
        self.shutdown.send_replace(false);

        let target = WatchTarget::Prefix(REGISTRY_ROOT.to_string());
        let (mut notices, watch_task) =
            ReconnectingWatch::with_config(self.store.clone(), target, self.reconnect.clone())
                .spawn(self.shutdown.subscribe());

        let cache = self.cache.clone();
        let watching = self.watching.clone();
        let stopping = self.shutdown.subscribe();

        let consumer = tokio::spawn(async move {
            while let Some(notice) = notices.recv().await {
                match notice {
                    WatchNotice::Event(event) => match parse_registry_key(&event.key) {
                        Some((service, _)) => cache.invalidate_cache(Some(service)),
                        None => debug!(key = %event.key, "ignoring unrelated key"),
                    },
                    WatchNotice::Subscribed => {
                        watching.store(true, Ordering::SeqCst);
                        cache.invalidate_cache(None);
                    }
                    WatchNotice::Resync => {
                        watching.store(false, Ordering::SeqCst);
                        cache.invalidate_cache(None);
                    }
                }
            }
            watching.store(false, Ordering::SeqCst);
            if !*stopping.borrow() {
                warn!("registry watch abandoned, discovery cache falls back to ttl expiry");
            }
        });

        tasks.push(watch_task);
        tasks.push(consumer);
        info!(ttl = ?self.cache.ttl(), "discovery cache watching registry");
    }

    /// Stop watching. The cache stays usable.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(STOP_GRACE, task).await.is_err() {
                abort.abort();
            }
        }
        self.watching.store(false, Ordering::SeqCst);
        debug!("discovery watch stopped");
    }
}

impl Drop for WatchableCachedDiscovery {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

#[async_trait]
impl ServiceDiscovery for WatchableCachedDiscovery {
    async fn discover_instances(&self, service: &str, only_healthy: bool) -> Vec<ServiceInstance> {
        self.cache.discover_instances(service, only_healthy).await
    }

    async fn select_instance(
        &self,
        service: &str,
        strategy: SelectionStrategy,
        preferred_instance_id: Option<&str>,
    ) -> Option<ServiceInstance> {
        self.cache
            .select_instance(service, strategy, preferred_instance_id)
            .await
    }
}
