//! A watch subscription that survives store disruptions.
//!
//! A raw [`WatchStream`] ends or yields an error when the store connection
//! drops. `ReconnectingWatch` re-subscribes with exponential backoff. It
//! emits [`WatchNotice::Resync`] when a live subscription breaks and
//! [`WatchNotice::Subscribed`] each time one is established, so consumers can
//! discard state derived from changes they never saw.

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::port::SharedStore;
use crate::types::{WatchEvent, WatchTarget};

/// Item delivered to consumers of a [`ReconnectingWatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchNotice {
    Event(WatchEvent),
    /// The subscription was interrupted; events may have been lost.
    Resync,
    /// A subscription is live. Changes made before it were not delivered.
    Subscribed,
}

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive failed subscribe attempts before giving up.
    pub max_attempts: u32,
    pub channel_capacity: usize,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            max_attempts: 10,
            channel_capacity: 256,
        }
    }
}

pub struct ReconnectingWatch {
    store: SharedStore,
    target: WatchTarget,
    config: ReconnectConfig,
}

impl ReconnectingWatch {
    pub fn new(store: SharedStore, target: WatchTarget) -> Self {
        Self::with_config(store, target, ReconnectConfig::default())
    }

    pub fn with_config(store: SharedStore, target: WatchTarget, config: ReconnectConfig) -> Self {
        Self {
            store,
            target,
            config,
        }
    }

    /// Start the subscription loop.
    ///
    /// The returned receiver closes when shutdown is signalled or after
    /// `max_attempts` consecutive subscribe failures.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> (mpsc::Receiver<WatchNotice>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let handle = tokio::spawn(self.run(tx, shutdown));
        (rx, handle)
    }

    async fn run(self, tx: mpsc::Sender<WatchNotice>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = self.config.initial_backoff;
        let mut failures = 0u32;

        loop {
            if *shutdown.borrow() {
                return;
            }

            match self.store.watch(self.target.clone()).await {
                Ok(mut stream) => {
                    if tx.send(WatchNotice::Subscribed).await.is_err() {
                        return;
                    }
                    failures = 0;
                    backoff = self.config.initial_backoff;
                    debug!(target = ?self.target, "watch subscribed");

                    loop {
                        tokio::select! {
                            item = stream.next() => match item {
                                Some(Ok(event)) => {
                                    if tx.send(WatchNotice::Event(event)).await.is_err() {
                                        return;
                                    }
                                }
                                Some(Err(e)) => {
                                    warn!(target = ?self.target, error = %e, "watch disrupted");
                                    break;
                                }
                                None => {
                                    warn!(target = ?self.target, "watch stream ended");
                                    break;
                                }
                            },
                            _ = shutdown.changed() => return,
                        }
                    }

                    if tx.send(WatchNotice::Resync).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    failures += 1;
                    if failures >= self.config.max_attempts {
                        error!(
                            target = ?self.target,
                            attempts = failures,
                            error = %e,
                            "giving up on watch after repeated failures"
                        );
                        return;
                    }
                    warn!(target = ?self.target, attempt = failures, error = %e, "watch subscribe failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => return,
            }
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }
}
