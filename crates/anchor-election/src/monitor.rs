//! Background loop that watches the leader lease from a standby instance
//! and triggers an election when the leader goes away.
//!
//! Each poll reads the lease. A fresh lease keeps the monitor in
//! [`MonitorState::WatchingLeader`]. An expired lease is re-checked once
//! after `grace_delay`; a missing lease (the leader released it) is handled
//! at once. Either way the election trigger fires a single time and the
//! monitor moves to [`MonitorState::HandlingExpiry`] until a fresh lease
//! shows up or `episode_timeout` elapses.
//!
//! Store failures back off exponentially. After `max_consecutive_failures`
//! in a row the loop stops and returns [`MonitorError::StoreUnavailable`].

use std::sync::Arc;
use std::time::Duration;

use anchor_core::time::epoch_millis;
use anchor_core::{FailoverPolicy, FailoverTimings};
use anchor_store::{StoreResult, WatchEvent, WatchOp, WatchStream};
use futures::StreamExt;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{ElectionResult, MonitorError};
use crate::repository::{ElectionRepository, HeartbeatStatus};

/// Callback invoked with `(service_name, group_id)` when the leader is gone.
pub type ElectionTrigger = Arc<dyn Fn(String, String) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    WatchingLeader,
    /// An election was triggered; waiting for a leader to appear.
    HandlingExpiry,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub grace_delay: Duration,
    pub max_consecutive_failures: u32,
    pub failure_backoff_max: Duration,
    pub episode_timeout: Duration,
    pub use_watch: bool,
    /// Delay before the first poll.
    pub initial_delay: Duration,
}

impl MonitorConfig {
    pub const MIN_INTERVAL: Duration = Duration::from_millis(100);
    pub const MAX_INTERVAL: Duration = Duration::from_secs(10);

    pub fn from_timings(timings: &FailoverTimings) -> Self {
        Self {
            interval: timings.monitor_interval,
            grace_delay: timings.grace_delay,
            max_consecutive_failures: 3,
            failure_backoff_max: timings.lease_ttl,
            episode_timeout: timings.lease_ttl,
            use_watch: true,
            initial_delay: Duration::ZERO,
        }
    }

    pub fn for_policy(policy: FailoverPolicy) -> Self {
        Self::from_timings(&policy.timings())
    }

    pub fn with_max_consecutive_failures(mut self, failures: u32) -> Self {
        self.max_consecutive_failures = failures.max(1);
        self
    }

    pub fn with_episode_timeout(mut self, timeout: Duration) -> Self {
        self.episode_timeout = timeout;
        self
    }

    pub fn with_watch(mut self, use_watch: bool) -> Self {
        self.use_watch = use_watch;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Poll interval clamped to `MIN_INTERVAL..=MAX_INTERVAL`.
    pub fn poll_interval(&self) -> Duration {
        self.interval.clamp(Self::MIN_INTERVAL, Self::MAX_INTERVAL)
    }

    /// Wait before the next poll after `failures` consecutive store errors.
    pub fn failure_backoff(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.min(16));
        self.poll_interval()
            .saturating_mul(factor)
            .min(self.failure_backoff_max.max(self.poll_interval()))
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::for_policy(FailoverPolicy::default())
    }
}

pub struct HeartbeatMonitor {
    repo: Arc<ElectionRepository>,
    config: MonitorConfig,
    trigger: ElectionTrigger,
    state: watch::Sender<MonitorState>,
}

impl HeartbeatMonitor {
    pub fn new(repo: Arc<ElectionRepository>, config: MonitorConfig, trigger: ElectionTrigger) -> Self {
        let (state, _) = watch::channel(MonitorState::WatchingLeader);
        Self {
            repo,
            config,
            trigger,
            state,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn state(&self) -> MonitorState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<MonitorState> {
        self.state.subscribe()
    }

    /// Run until `shutdown` flips to `true` (returns `Ok`) or the store
    /// fails too many times in a row (returns the fatal error).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), MonitorError> {
        let service = self.repo.service_name().to_string();
        let group = self.repo.group_id().to_string();
        let interval = self.config.poll_interval();

        self.set_state(MonitorState::WatchingLeader);
        let mut events = self.subscribe_leader_key().await;
        let mut failures = 0u32;
        let mut episode_started: Option<Instant> = None;
        let mut next_poll = Instant::now() + self.config.initial_delay;

        debug!(%service, %group, ?interval, "heartbeat monitor starting");

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep_until(next_poll) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                event = next_event(&mut events) => match event {
                    Some(Ok(event)) if matches!(event.operation, WatchOp::Delete | WatchOp::Purge) => {
                        debug!(%service, %group, op = ?event.operation, "leader key removed");
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(%service, %group, error = %e, "leader key watch failed, polling only");
                        events = None;
                        continue;
                    }
                    None => {
                        debug!(%service, %group, "leader key watch closed, polling only");
                        events = None;
                        continue;
                    }
                },
            }

            let status = match self.poll().await {
                Ok(status) => {
                    failures = 0;
                    status
                }
                Err(e) => {
                    next_poll = Instant::now() + self.record_failure(&mut failures, e)?;
                    continue;
                }
            };

            match status {
                Some(status) if !status.is_expired => {
                    if self.state() == MonitorState::HandlingExpiry {
                        info!(%service, %group, leader = %status.instance_id, "leader lease observed");
                    }
                    self.set_state(MonitorState::WatchingLeader);
                    episode_started = None;
                }
                status => match self.state() {
                    MonitorState::WatchingLeader => {
                        if let Some(expired) = status {
                            warn!(
                                %service,
                                %group,
                                leader = %expired.instance_id,
                                since_last = ?expired.time_since_last,
                                grace = ?self.config.grace_delay,
                                "leader lease expired, re-checking after grace delay"
                            );
                            if !sleep_or_shutdown(self.config.grace_delay, &mut shutdown).await {
                                break;
                            }
                            match self.poll().await {
                                Ok(Some(status)) if !status.is_expired => {
                                    debug!(%service, %group, leader = %status.instance_id, "lease renewed during grace delay");
                                    failures = 0;
                                    next_poll = Instant::now() + interval;
                                    continue;
                                }
                                Ok(_) => failures = 0,
                                Err(e) => {
                                    next_poll = Instant::now() + self.record_failure(&mut failures, e)?;
                                    continue;
                                }
                            }
                        } else {
                            info!(%service, %group, "leader lease released");
                        }
                        self.fire(&service, &group).await;
                        episode_started = Some(Instant::now());
                    }
                    MonitorState::HandlingExpiry => {
                        let timed_out = episode_started
                            .is_none_or(|started| started.elapsed() >= self.config.episode_timeout);
                        if timed_out {
                            warn!(%service, %group, timeout = ?self.config.episode_timeout, "no leader after election episode, re-triggering");
                            self.fire(&service, &group).await;
                            episode_started = Some(Instant::now());
                        }
                    }
                    MonitorState::Stopped => {}
                },
            }

            next_poll = Instant::now() + interval;
        }

        self.set_state(MonitorState::Stopped);
        debug!(%service, %group, "heartbeat monitor shutting down");
        Ok(())
    }

    async fn poll(&self) -> ElectionResult<Option<HeartbeatStatus>> {
        self.repo.heartbeat_status(epoch_millis()).await
    }

    async fn fire(&self, service: &str, group: &str) {
        self.set_state(MonitorState::HandlingExpiry);
        info!(%service, %group, "triggering election");
        (self.trigger)(service.to_string(), group.to_string()).await;
    }

    /// Count a failed poll; the backoff to wait, or the fatal error.
    fn record_failure(&self, failures: &mut u32, e: impl std::fmt::Display) -> Result<Duration, MonitorError> {
        *failures += 1;
        if *failures >= self.config.max_consecutive_failures {
            self.set_state(MonitorState::Stopped);
            error!(
                service = %self.repo.service_name(),
                group = %self.repo.group_id(),
                failures = *failures,
                error = %e,
                "heartbeat monitor stopping after consecutive store failures"
            );
            return Err(MonitorError::StoreUnavailable {
                failures: *failures,
                last_error: e.to_string(),
            });
        }
        let backoff = self.config.failure_backoff(*failures);
        warn!(
            service = %self.repo.service_name(),
            failures = *failures,
            ?backoff,
            error = %e,
            "heartbeat poll failed"
        );
        Ok(backoff)
    }

    async fn subscribe_leader_key(&self) -> Option<WatchStream> {
        if !self.config.use_watch {
            return None;
        }
        match self.repo.watch().await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(key = %self.repo.key(), error = %e, "leader key watch unavailable, polling only");
                None
            }
        }
    }

    fn set_state(&self, state: MonitorState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

async fn next_event(events: &mut Option<WatchStream>) -> Option<StoreResult<WatchEvent>> {
    match events {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

/// `false` if shutdown was signalled first.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::repository::LeaseRecord;
    use anchor_store::{CoordinationStore, FaultyStore, KvOptions, RedbStore, SharedStore};
    use futures::FutureExt;

    fn counting_trigger() -> (ElectionTrigger, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let trigger: ElectionTrigger = Arc::new(move |_: String, _: String| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        });
        (trigger, count)
    }

    fn fast_config() -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_millis(100),
            grace_delay: Duration::from_millis(150),
            max_consecutive_failures: 3,
            failure_backoff_max: Duration::from_millis(400),
            episode_timeout: Duration::from_secs(10),
            use_watch: false,
            initial_delay: Duration::ZERO,
        }
    }

    fn spawn(
        monitor: Arc<HeartbeatMonitor>,
    ) -> (watch::Sender<bool>, tokio::task::JoinHandle<Result<(), MonitorError>>) {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { monitor.run(rx).await });
        (tx, handle)
    }

    async fn write_lease(store: &SharedStore, key: &str, instance_id: &str, renewed_at_ms: u64, ttl_ms: u64) {
        let lease = LeaseRecord {
            instance_id: instance_id.into(),
            acquired_at_ms: renewed_at_ms,
            renewed_at_ms,
            ttl_ms,
        };
        store
            .put(key, serde_json::to_vec(&lease).unwrap(), KvOptions::default())
            .await
            .unwrap();
    }

    fn setup() -> (SharedStore, Arc<ElectionRepository>) {
        let store: SharedStore = Arc::new(RedbStore::open_in_memory().unwrap());
        let repo = Arc::new(ElectionRepository::new(store.clone(), "orders", "g1"));
        (store, repo)
    }

    #[test]
    fn interval_is_clamped() {
        let mut config = fast_config();
        config.interval = Duration::from_millis(5);
        assert_eq!(config.poll_interval(), MonitorConfig::MIN_INTERVAL);
        config.interval = Duration::from_secs(60);
        assert_eq!(config.poll_interval(), MonitorConfig::MAX_INTERVAL);
    }

    #[test]
    fn failure_backoff_doubles_up_to_cap() {
        let config = fast_config();
        assert_eq!(config.failure_backoff(1), Duration::from_millis(200));
        assert_eq!(config.failure_backoff(2), Duration::from_millis(400));
        assert_eq!(config.failure_backoff(3), Duration::from_millis(400));
    }

    #[test]
    fn policy_presets() {
        let config = MonitorConfig::for_policy(FailoverPolicy::Aggressive);
        assert_eq!(config.interval, Duration::from_millis(500));
        assert_eq!(config.grace_delay, Duration::from_millis(250));
        assert_eq!(config.episode_timeout, Duration::from_secs(3));
        assert_eq!(config.max_consecutive_failures, 3);
    }

    #[tokio::test]
    async fn absent_lease_triggers_once() {
        let (_, repo) = setup();
        let (trigger, count) = counting_trigger();
        let monitor = Arc::new(HeartbeatMonitor::new(repo, fast_config(), trigger));

        let (tx, handle) = spawn(monitor.clone());
        tokio::time::sleep(Duration::from_millis(450)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.state(), MonitorState::HandlingExpiry);

        tx.send(true).unwrap();
        assert!(handle.await.unwrap().is_ok());
        assert_eq!(monitor.state(), MonitorState::Stopped);
    }

    #[tokio::test]
    async fn fresh_lease_does_not_trigger() {
        let (_, repo) = setup();
        repo.try_acquire("leader", Duration::from_secs(10)).await.unwrap();
        let (trigger, count) = counting_trigger();
        let monitor = Arc::new(HeartbeatMonitor::new(repo, fast_config(), trigger));

        let (tx, handle) = spawn(monitor.clone());
        tokio::time::sleep(Duration::from_millis(350)).await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(monitor.state(), MonitorState::WatchingLeader);
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn expired_lease_triggers_after_grace() {
        let (store, repo) = setup();
        write_lease(&store, repo.key(), "leader", 1_000, 500).await;
        let (trigger, count) = counting_trigger();
        let monitor = Arc::new(HeartbeatMonitor::new(repo, fast_config(), trigger));

        let (tx, handle) = spawn(monitor.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Still inside the grace delay.
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.state(), MonitorState::HandlingExpiry);

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn renewal_during_grace_cancels_trigger() {
        let (store, repo) = setup();
        write_lease(&store, repo.key(), "leader", 1_000, 500).await;
        let (trigger, count) = counting_trigger();
        let monitor = Arc::new(HeartbeatMonitor::new(repo.clone(), fast_config(), trigger));

        let (tx, handle) = spawn(monitor.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        write_lease(&store, repo.key(), "leader", epoch_millis(), 10_000).await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(monitor.state(), MonitorState::WatchingLeader);

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn episode_timeout_rearms_trigger() {
        let (_, repo) = setup();
        let (trigger, count) = counting_trigger();
        let config = fast_config().with_episode_timeout(Duration::from_millis(150));
        let monitor = Arc::new(HeartbeatMonitor::new(repo, config, trigger));

        let (tx, handle) = spawn(monitor);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(count.load(Ordering::SeqCst) >= 2);

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn new_leader_ends_episode() {
        let (_, repo) = setup();
        let (trigger, count) = counting_trigger();
        let monitor = Arc::new(HeartbeatMonitor::new(repo.clone(), fast_config(), trigger));

        let (tx, handle) = spawn(monitor.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(monitor.state(), MonitorState::HandlingExpiry);

        repo.try_acquire("someone-else", Duration::from_secs(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(monitor.state(), MonitorState::WatchingLeader);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn watch_delete_is_handled_before_next_poll() {
        let (_, repo) = setup();
        repo.try_acquire("leader", Duration::from_secs(10)).await.unwrap();
        let (trigger, count) = counting_trigger();
        let mut config = fast_config().with_watch(true);
        config.interval = Duration::from_secs(10);
        let monitor = Arc::new(HeartbeatMonitor::new(repo.clone(), config, trigger));

        let (tx, handle) = spawn(monitor);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        repo.release("leader").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn store_outage_stops_monitor() {
        let faulty = Arc::new(FaultyStore::new(RedbStore::open_in_memory().unwrap()));
        faulty.set_available(false);
        let repo = Arc::new(ElectionRepository::new(faulty.clone(), "orders", "g1"));
        let (trigger, count) = counting_trigger();
        let monitor = Arc::new(HeartbeatMonitor::new(repo, fast_config(), trigger));

        let (_tx, handle) = spawn(monitor.clone());
        let result = tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(result, Err(MonitorError::StoreUnavailable { failures: 3, .. })));
        assert_eq!(monitor.state(), MonitorState::Stopped);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(faulty.rejected(), 3);
    }

    #[tokio::test]
    async fn recovered_store_resets_failure_streak() {
        let faulty = Arc::new(FaultyStore::new(RedbStore::open_in_memory().unwrap()));
        let repo = Arc::new(ElectionRepository::new(faulty.clone(), "orders", "g1"));
        repo.try_acquire("leader", Duration::from_secs(30)).await.unwrap();
        let (trigger, _) = counting_trigger();
        let monitor = Arc::new(HeartbeatMonitor::new(repo, fast_config(), trigger));

        faulty.set_available(false);
        let (tx, handle) = spawn(monitor.clone());
        // Two failures (t=0, t=200ms), then the store comes back.
        tokio::time::sleep(Duration::from_millis(300)).await;
        faulty.set_available(true);
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(monitor.state(), MonitorState::WatchingLeader);
        assert!(!handle.is_finished());
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
