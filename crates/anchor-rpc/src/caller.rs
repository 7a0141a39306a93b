//! Calling a service across a leader failover.
//!
//! A call that lands on a standby during a failover window fails with
//! `NotActive`. The caller retries errors whose kind the policy lists as
//! retryable, sleeping `min(initial · multiplier^attempt, max)` scaled by a
//! uniform jitter between attempts. Every other error is returned as is.

use std::time::{Duration, Instant};

use anchor_core::{ErrorKind, RetryPolicy};
use anchor_metrics::SharedSink;
use rand::Rng;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{RpcError, RpcResult};
use crate::transport::{CallTarget, SharedTransport};

pub struct ResilientCaller {
    transport: SharedTransport,
    metrics: SharedSink,
    call_timeout: Duration,
}

impl ResilientCaller {
    pub fn new(transport: SharedTransport, metrics: SharedSink, call_timeout: Duration) -> Self {
        Self {
            transport,
            metrics,
            call_timeout,
        }
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Send `method` to `target`, retrying per `policy`. A policy that fails
    /// validation is rejected before anything is sent.
    pub async fn call(
        &self,
        target: &CallTarget,
        method: &str,
        params: Value,
        policy: &RetryPolicy,
    ) -> RpcResult<Value> {
        policy
            .validate()
            .map_err(|e| RpcError::InvalidPolicy(e.to_string()))?;
        let service = target.service();
        let started = Instant::now();
        let mut retries = 0u32;

        loop {
            let err = match self
                .transport
                .request(target, method, params.clone(), self.call_timeout)
                .await
            {
                Ok(value) => {
                    if retries > 0 {
                        let latency = started.elapsed();
                        self.metrics
                            .incr_counter(&format!("rpc.{service}.{method}.success_after_retry"), 1);
                        self.metrics
                            .record_duration(&format!("rpc.{service}.{method}.failover_latency"), latency);
                        info!(%target, %method, retries, ?latency, "call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            let kind = err.kind();
            if !policy.is_retryable(kind) {
                debug!(%target, %method, error = %err, "non-retryable call failure");
                return Err(err);
            }
            if retries >= policy.max_retries {
                warn!(%target, %method, retries, error = %err, "retries exhausted");
                return Err(RpcError::RetriesExhausted {
                    retries,
                    last: Box::new(err),
                });
            }

            if kind == ErrorKind::NotActive {
                self.metrics
                    .incr_counter(&format!("rpc.{service}.{method}.not_active_retry"), 1);
            }
            let sample = rand::rng().random_range(-1.0..=1.0);
            let delay = policy.delay_for(retries, sample);
            debug!(%target, %method, attempt = retries + 1, ?delay, error = %err, "retrying call");
            tokio::time::sleep(delay).await;
            retries += 1;
        }
    }
}
