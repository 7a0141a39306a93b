//! One peer of a sticky single-active group.
//!
//! Every peer registers itself and competes for the group's lease. The
//! winner is `Active`: it renews the lease on a fixed cadence and serves
//! exclusive methods. Everyone else is `Standby`: it runs a
//! [`HeartbeatMonitor`] whose trigger re-attempts the acquisition once the
//! leader is gone.
//!
//! ```text
//!            try_acquire won
//!   Standby ─────────────────▶ Active
//!      ▲                         │
//!      └─────────────────────────┘
//!   renew → false, store grace exceeded, or stop()
//! ```
//!
//! Transitions are compare-and-swap guarded on a `watch` channel, so each
//! one fires the [`LeadershipListener`] callbacks exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anchor_core::{InstanceStatus, LEADER_FLAG, ServiceInstance};
use anchor_registry::ServiceRegistry;
use anchor_rpc::{HandlerRegistry, RpcEndpoint, RpcResult};
use anchor_store::SharedStore;
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::ServiceConfig;
use crate::error::{ElectionError, ElectionResult, MonitorError};
use crate::monitor::{ElectionTrigger, HeartbeatMonitor};
use crate::repository::ElectionRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Standby,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    /// The heartbeat monitor gave up on the coordination store.
    Unhealthy,
}

/// Leadership change callbacks. Invoked synchronously on the task that
/// performed the transition, so implementations must not block.
pub trait LeadershipListener: Send + Sync {
    fn on_became_leader(&self, service_name: &str, instance_id: &str);
    fn on_lost_leadership(&self, service_name: &str, instance_id: &str);
}

struct Inner {
    config: ServiceConfig,
    repo: Arc<ElectionRepository>,
    registry: Arc<ServiceRegistry>,
    handlers: Arc<HandlerRegistry>,
    state: watch::Sender<ServiceState>,
    healthy: AtomicBool,
    listeners: RwLock<Vec<Arc<dyn LeadershipListener>>>,
    /// What the registry heartbeat writes.
    record: tokio::sync::Mutex<ServiceInstance>,
    /// When the winning `try_acquire` was issued. The store's expiry for the
    /// fresh lease runs from no earlier than this.
    acquired_at: Mutex<Option<Instant>>,
}

pub struct SingleActiveService {
    inner: Arc<Inner>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl SingleActiveService {
    pub fn new(
        config: ServiceConfig,
        store: SharedStore,
        registry: Arc<ServiceRegistry>,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        let repo = Arc::new(ElectionRepository::new(store, &config.service_name, &config.group_id));
        let mut record = ServiceInstance::new(&config.service_name, &config.instance_id, &config.version)
            .with_group(&config.group_id)
            .with_metadata(LEADER_FLAG, "false");
        record
            .metadata
            .extend(config.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));

        let (state, _) = watch::channel(ServiceState::Standby);
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                config,
                repo,
                registry,
                handlers,
                state,
                healthy: AtomicBool::new(true),
                listeners: RwLock::new(Vec::new()),
                record: tokio::sync::Mutex::new(record),
                acquired_at: Mutex::new(None),
            }),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn LeadershipListener>) {
        self.inner.listeners.write().unwrap().push(listener);
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.config.instance_id
    }

    pub fn state(&self) -> ServiceState {
        *self.inner.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ServiceState::Active
    }

    pub fn health(&self) -> Health {
        if self.inner.healthy.load(Ordering::SeqCst) {
            Health::Healthy
        } else {
            Health::Unhealthy
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
        self.inner.state.subscribe()
    }

    /// Current lease holder of this instance's group, as stored.
    pub async fn current_leader(&self) -> ElectionResult<Option<String>> {
        Ok(self
            .inner
            .repo
            .current_lease()
            .await?
            .map(|(lease, _)| lease.instance_id))
    }

    /// Register, make one acquisition attempt, and spawn the background
    /// loops. A store error during the attempt leaves the instance in
    /// `Standby`; a registration failure is returned.
    pub async fn start(&self) -> ElectionResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ElectionError::AlreadyStarted);
        }
        if let Err(e) = self.inner.config.validate() {
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }
        if let Err(e) = self.register().await {
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let inner = &self.inner;
        let id = inner.config.instance_id.as_str();
        let attempted = Instant::now();
        match inner.repo.try_acquire(id, inner.config.timings.lease_ttl).await {
            Ok(true) => {
                *inner.acquired_at.lock().unwrap() = Some(attempted);
                inner.transition(ServiceState::Active).await;
            }
            Ok(false) => info!(instance_id = %id, "lease held elsewhere, starting as standby"),
            Err(e) => warn!(instance_id = %id, error = %e, "initial election attempt failed, starting as standby"),
        }

        let supervisor = tokio::spawn(supervise(inner.clone(), self.shutdown.subscribe()));
        let heartbeat = tokio::spawn(registry_heartbeat(inner.clone(), self.shutdown.subscribe()));
        self.tasks.lock().unwrap().extend([supervisor, heartbeat]);

        info!(
            service = %inner.config.service_name,
            group = %inner.config.group_id,
            instance_id = %id,
            state = ?self.state(),
            "service started"
        );
        Ok(())
    }

    /// Signal shutdown, release the lease if held, and deregister.
    pub async fn stop(&self) -> ElectionResult<()> {
        if !self.started.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.send_replace(true);

        let inner = &self.inner;
        let id = inner.config.instance_id.as_str();
        let grace = inner.config.shutdown_grace;
        let handles = std::mem::take(&mut *self.tasks.lock().unwrap());
        for mut handle in handles {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!(instance_id = %id, ?grace, "background task did not stop in time, aborting");
                handle.abort();
            }
        }

        // Only reached with the lease still held if the supervisor was aborted.
        if self.is_active() {
            if let Err(e) = inner.repo.release(id).await {
                warn!(instance_id = %id, error = %e, "failed to release lease on stop");
            }
            inner.transition(ServiceState::Standby).await;
        }

        inner.registry.deregister(&inner.config.service_name, id).await?;
        info!(service = %inner.config.service_name, instance_id = %id, "service stopped");
        Ok(())
    }

    async fn register(&self) -> ElectionResult<()> {
        let record = self.inner.record.lock().await.clone();
        self.inner
            .registry
            .register(&record, self.inner.config.registry_ttl)
            .await?;
        Ok(())
    }
}

impl Drop for SingleActiveService {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

#[async_trait]
impl RpcEndpoint for SingleActiveService {
    fn service_name(&self) -> &str {
        &self.inner.config.service_name
    }

    fn instance_id(&self) -> &str {
        &self.inner.config.instance_id
    }

    async fn handle(&self, method: &str, params: Value) -> RpcResult<Value> {
        self.inner
            .handlers
            .dispatch(self.instance_id(), self.is_active(), method, params)
            .await
    }
}

// ── Background loops ──────────────────────────────────────────────

enum LeaseOutcome {
    Lost,
    Shutdown,
}

enum VacancyOutcome {
    Won,
    Shutdown,
    Failed(MonitorError),
}

async fn supervise(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let id = inner.config.instance_id.clone();
    let mut demoted = false;

    loop {
        if *shutdown.borrow() {
            break;
        }
        match inner.current_state() {
            ServiceState::Active => match inner.hold_lease(&mut shutdown).await {
                LeaseOutcome::Lost => {
                    inner.transition(ServiceState::Standby).await;
                    demoted = true;
                }
                LeaseOutcome::Shutdown => {
                    if let Err(e) = inner.repo.release(&id).await {
                        warn!(instance_id = %id, error = %e, "failed to release lease on shutdown");
                    }
                    inner.transition(ServiceState::Standby).await;
                    break;
                }
            },
            ServiceState::Standby => {
                let outcome = inner.watch_for_vacancy(&shutdown, demoted).await;
                demoted = false;
                match outcome {
                    VacancyOutcome::Won => {
                        inner.transition(ServiceState::Active).await;
                    }
                    VacancyOutcome::Shutdown => break,
                    VacancyOutcome::Failed(e) => {
                        inner.mark_unhealthy(&e).await;
                        break;
                    }
                }
            }
        }
    }
    debug!(instance_id = %id, "supervisor exiting");
}

async fn registry_heartbeat(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let interval = inner.config.registry_heartbeat_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let record = inner.record.lock().await.clone();
                if let Err(e) = inner.registry.update_heartbeat(&record, inner.config.registry_ttl).await {
                    warn!(instance_id = %record.instance_id, error = %e, "registry heartbeat failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

impl Inner {
    fn current_state(&self) -> ServiceState {
        *self.state.borrow()
    }

    /// Renew until the lease is lost or shutdown is signalled.
    ///
    /// The store expires the lease no earlier than `lease_ttl` after the last
    /// successful write was issued, so stepping down at `store_grace` after
    /// that instant (with `store_grace < lease_ttl`) leaves the lease ours
    /// for as long as we report `Active`. The deadline is enforced by a timer,
    /// including while a renewal is still in flight.
    async fn hold_lease(&self, shutdown: &mut watch::Receiver<bool>) -> LeaseOutcome {
        let id = self.config.instance_id.as_str();
        let ttl = self.config.timings.lease_ttl;
        let every = self.config.timings.renew_interval;
        let grace = self.config.store_grace;
        let mut renewed_from = self
            .acquired_at
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(Instant::now);
        let mut ticker = tokio::time::interval_at(renewed_from + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = renewed_from + grace;
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    error!(instance_id = %id, ?grace, "no successful renewal within store grace, stepping down");
                    return LeaseOutcome::Lost;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return LeaseOutcome::Shutdown;
                    }
                    continue;
                }
            }

            let issued = Instant::now();
            match tokio::time::timeout_at(deadline, self.repo.renew(id, ttl)).await {
                Ok(Ok(true)) => renewed_from = issued,
                Ok(Ok(false)) => {
                    warn!(instance_id = %id, "lease lost");
                    return LeaseOutcome::Lost;
                }
                Ok(Err(e)) => {
                    warn!(instance_id = %id, error = %e, since = ?renewed_from.elapsed(), "lease renewal failed");
                }
                Err(_) => {
                    error!(instance_id = %id, ?grace, "lease renewal still pending at store grace, stepping down");
                    return LeaseOutcome::Lost;
                }
            }
        }
    }

    /// Monitor the leader until this instance wins an election, shutdown is
    /// signalled, or the monitor fails.
    async fn watch_for_vacancy(self: &Arc<Self>, shutdown: &watch::Receiver<bool>, demoted: bool) -> VacancyOutcome {
        let (won_tx, mut won_rx) = mpsc::channel(1);
        let mut config = self.config.monitor.clone();
        if demoted {
            // Give the other peers the first shot at the vacancy we just left.
            config.initial_delay = config.poll_interval() + config.grace_delay;
        }
        let monitor = HeartbeatMonitor::new(self.repo.clone(), config, self.election_trigger(won_tx));

        let outcome = {
            let run = monitor.run(shutdown.clone());
            tokio::pin!(run);
            tokio::select! {
                biased;
                Some(()) = won_rx.recv() => VacancyOutcome::Won,
                result = &mut run => match result {
                    Ok(()) => VacancyOutcome::Shutdown,
                    Err(e) => VacancyOutcome::Failed(e),
                },
            }
        };

        // An election won just as the monitor stopped still holds the lease.
        let won_late = !matches!(outcome, VacancyOutcome::Won) && won_rx.try_recv().is_ok();
        if !won_late {
            return outcome;
        }
        match outcome {
            VacancyOutcome::Shutdown => {
                if let Err(e) = self.repo.release(&self.config.instance_id).await {
                    warn!(instance_id = %self.config.instance_id, error = %e, "failed to release lease won during shutdown");
                }
                VacancyOutcome::Shutdown
            }
            _ => VacancyOutcome::Won,
        }
    }

    fn election_trigger(self: &Arc<Self>, won: mpsc::Sender<()>) -> ElectionTrigger {
        let inner = self.clone();
        Arc::new(move |service: String, group: String| {
            let inner = inner.clone();
            let won = won.clone();
            async move {
                let id = inner.config.instance_id.as_str();
                let attempted = Instant::now();
                match inner.repo.try_acquire(id, inner.config.timings.lease_ttl).await {
                    Ok(true) => {
                        *inner.acquired_at.lock().unwrap() = Some(attempted);
                        let _ = won.try_send(());
                    }
                    Ok(false) => debug!(%service, %group, instance_id = %id, "election lost to another instance"),
                    Err(e) => warn!(%service, %group, instance_id = %id, error = %e, "election attempt failed"),
                }
            }
            .boxed()
        })
    }

    /// Swap the state; listeners and the registry only hear about real changes.
    async fn transition(&self, to: ServiceState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == to {
                false
            } else {
                *current = to;
                true
            }
        });
        if !changed {
            return false;
        }

        let service = self.config.service_name.as_str();
        let id = self.config.instance_id.as_str();
        match to {
            ServiceState::Active => info!(%service, group = %self.config.group_id, instance_id = %id, "became active"),
            ServiceState::Standby => info!(%service, group = %self.config.group_id, instance_id = %id, "now standby"),
        }

        let listeners = self.listeners.read().unwrap().clone();
        for listener in &listeners {
            match to {
                ServiceState::Active => listener.on_became_leader(service, id),
                ServiceState::Standby => listener.on_lost_leadership(service, id),
            }
        }

        let (status, leader) = match to {
            ServiceState::Active => (InstanceStatus::Active, true),
            ServiceState::Standby => (InstanceStatus::Standby, false),
        };
        self.publish_status(status, leader).await;
        true
    }

    async fn mark_unhealthy(&self, e: &MonitorError) {
        self.healthy.store(false, Ordering::SeqCst);
        error!(
            service = %self.config.service_name,
            instance_id = %self.config.instance_id,
            error = %e,
            "instance unhealthy, election supervision stopped"
        );
        self.publish_status(InstanceStatus::Unhealthy, false).await;
    }

    /// Update the local record and push the status to the registry.
    async fn publish_status(&self, status: InstanceStatus, leader: bool) {
        {
            let mut record = self.record.lock().await;
            record.status = status;
            record.metadata.insert(LEADER_FLAG.to_string(), leader.to_string());
        }
        let patch = HashMap::from([(LEADER_FLAG.to_string(), leader.to_string())]);
        if let Err(e) = self
            .registry
            .update_status(&self.config.service_name, &self.config.instance_id, status, patch)
            .await
        {
            warn!(instance_id = %self.config.instance_id, ?status, error = %e, "failed to publish status to registry");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use anchor_core::FailoverTimings;
    use anchor_metrics::NoopSink;
    use anchor_rpc::{RpcError, handler};
    use anchor_store::{CoordinationStore, RedbStore};
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl LeadershipListener for Recorder {
        fn on_became_leader(&self, _: &str, instance_id: &str) {
            self.events.lock().unwrap().push(format!("leader:{instance_id}"));
        }

        fn on_lost_leadership(&self, _: &str, instance_id: &str) {
            self.events.lock().unwrap().push(format!("lost:{instance_id}"));
        }
    }

    struct Fixture {
        store: SharedStore,
        registry: Arc<ServiceRegistry>,
        handlers: Arc<HandlerRegistry>,
    }

    impl Fixture {
        fn new() -> Self {
            let store: SharedStore = Arc::new(RedbStore::open_in_memory().unwrap());
            let registry = Arc::new(ServiceRegistry::new(
                store.clone(),
                NoopSink::shared(),
                Duration::from_secs(30),
            ));
            let handlers = Arc::new(HandlerRegistry::new());
            handlers.register_exclusive("place", handler(|p| async move { Ok(p) }));
            handlers.register_ordinary("ping", handler(|_| async move { Ok(json!("pong")) }));
            Self {
                store,
                registry,
                handlers,
            }
        }

        fn service(&self, id: &str) -> SingleActiveService {
            let config = ServiceConfig::new("orders", "g1", id, "1.0.0")
                .with_timings(FailoverTimings::from_ttl(Duration::from_millis(600)))
                .with_registry(Duration::from_secs(5), Duration::from_millis(200))
                .with_shutdown_grace(Duration::from_millis(500));
            SingleActiveService::new(config, self.store.clone(), self.registry.clone(), self.handlers.clone())
        }
    }

    #[tokio::test]
    async fn first_starter_becomes_active() {
        let fx = Fixture::new();
        let a = fx.service("orders-1");
        let b = fx.service("orders-2");
        a.start().await.unwrap();
        b.start().await.unwrap();

        assert_eq!(a.state(), ServiceState::Active);
        assert_eq!(b.state(), ServiceState::Standby);
        assert_eq!(a.current_leader().await.unwrap().as_deref(), Some("orders-1"));

        let record = fx.registry.get_instance("orders", "orders-1").await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Active);
        assert!(record.is_leader());
        let record = fx.registry.get_instance("orders", "orders-2").await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Standby);
        assert!(!record.is_leader());

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let fx = Fixture::new();
        let a = fx.service("orders-1");
        a.start().await.unwrap();
        assert!(matches!(a.start().await, Err(ElectionError::AlreadyStarted)));
        a.stop().await.unwrap();
    }

    #[tokio::test]
    async fn exclusive_methods_follow_leadership() {
        let fx = Fixture::new();
        let a = fx.service("orders-1");
        let b = fx.service("orders-2");
        a.start().await.unwrap();
        b.start().await.unwrap();

        assert_eq!(a.handle("place", json!({"id": 1})).await.unwrap(), json!({"id": 1}));
        let err = b.handle("place", json!({"id": 1})).await.unwrap_err();
        assert!(matches!(err, RpcError::NotActive { ref instance_id, .. } if instance_id == "orders-2"));
        assert_eq!(b.handle("ping", json!(null)).await.unwrap(), json!("pong"));

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_hands_over_to_standby() {
        let fx = Fixture::new();
        let a = fx.service("orders-1");
        let b = fx.service("orders-2");
        let recorder = Arc::new(Recorder::default());
        a.add_listener(recorder.clone());
        b.add_listener(recorder.clone());

        a.start().await.unwrap();
        b.start().await.unwrap();
        let mut b_state = b.subscribe();

        a.stop().await.unwrap();
        assert_eq!(a.state(), ServiceState::Standby);
        assert!(fx.registry.get_instance("orders", "orders-1").await.unwrap().is_none());

        tokio::time::timeout(Duration::from_secs(2), b_state.wait_for(|s| *s == ServiceState::Active))
            .await
            .unwrap()
            .unwrap();

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], "leader:orders-1");
        assert!(events.contains(&"lost:orders-1".to_string()));
        assert!(events.contains(&"leader:orders-2".to_string()));

        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn lost_lease_steps_down() {
        let fx = Fixture::new();
        let a = fx.service("orders-1");
        a.start().await.unwrap();
        let mut state = a.subscribe();

        // Someone else takes the key between renewals.
        fx.store.delete("anchor/election/orders/g1").await.unwrap();
        let repo = ElectionRepository::new(fx.store.clone(), "orders", "g1");
        assert!(repo.try_acquire("intruder", Duration::from_secs(30)).await.unwrap());

        tokio::time::timeout(Duration::from_secs(1), state.wait_for(|s| *s == ServiceState::Standby))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.current_leader().await.unwrap().as_deref(), Some("intruder"));

        a.stop().await.unwrap();
        // Stopping a standby never touches someone else's lease.
        assert_eq!(repo.current_lease().await.unwrap().unwrap().0.instance_id, "intruder");
    }

    #[tokio::test]
    async fn registry_heartbeat_keeps_record_fresh() {
        let fx = Fixture::new();
        let a = fx.service("orders-1");
        a.start().await.unwrap();

        let first = fx.registry.get_instance("orders", "orders-1").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(450)).await;
        let later = fx.registry.get_instance("orders", "orders-1").await.unwrap().unwrap();
        assert!(later.last_heartbeat_ms > first.last_heartbeat_ms);
        assert_eq!(later.status, InstanceStatus::Active);

        a.stop().await.unwrap();
    }
}
