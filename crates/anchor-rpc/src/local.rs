//! In-process transport.
//!
//! Endpoints register under their service name. A service-level target is
//! routed round-robin across the registered endpoints, so a caller that
//! keeps retrying eventually reaches every instance, including a newly
//! elected leader.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{RpcError, RpcResult};
use crate::transport::{CallTarget, RpcEndpoint, Transport};

#[derive(Default)]
struct ServiceEndpoints {
    endpoints: Vec<Arc<dyn RpcEndpoint>>,
    counter: AtomicUsize,
}

#[derive(Default)]
pub struct LocalTransport {
    services: RwLock<HashMap<String, ServiceEndpoints>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an endpoint, replacing one with the same instance id.
    pub fn register(&self, endpoint: Arc<dyn RpcEndpoint>) {
        let service = endpoint.service_name().to_string();
        let instance_id = endpoint.instance_id().to_string();
        let mut services = self.services.write().unwrap();
        let entry = services.entry(service.clone()).or_default();
        entry.endpoints.retain(|e| e.instance_id() != instance_id);
        entry.endpoints.push(endpoint);
        debug!(%service, %instance_id, "endpoint registered");
    }

    pub fn unregister(&self, service: &str, instance_id: &str) -> bool {
        let mut services = self.services.write().unwrap();
        let Some(entry) = services.get_mut(service) else {
            return false;
        };
        let before = entry.endpoints.len();
        entry.endpoints.retain(|e| e.instance_id() != instance_id);
        let removed = entry.endpoints.len() != before;
        if removed {
            debug!(%service, %instance_id, "endpoint unregistered");
        }
        removed
    }

    pub fn endpoint_count(&self, service: &str) -> usize {
        self.services
            .read()
            .unwrap()
            .get(service)
            .map(|e| e.endpoints.len())
            .unwrap_or(0)
    }

    fn resolve(&self, target: &CallTarget) -> RpcResult<Arc<dyn RpcEndpoint>> {
        let services = self.services.read().unwrap();
        let entry = services
            .get(target.service())
            .filter(|e| !e.endpoints.is_empty())
            .ok_or_else(|| RpcError::NoInstances(target.service().to_string()))?;

        match target {
            CallTarget::Service(_) => {
                let idx = entry.counter.fetch_add(1, Ordering::Relaxed) % entry.endpoints.len();
                Ok(entry.endpoints[idx].clone())
            }
            CallTarget::Instance { instance_id, .. } => entry
                .endpoints
                .iter()
                .find(|e| e.instance_id() == instance_id)
                .cloned()
                .ok_or_else(|| RpcError::Transport(format!("unknown instance {target}"))),
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn request(
        &self,
        target: &CallTarget,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> RpcResult<Value> {
        let endpoint = self.resolve(target)?;
        trace!(%target, instance_id = %endpoint.instance_id(), %method, "dispatching");
        tokio::time::timeout(timeout, endpoint.handle(method, params))
            .await
            .map_err(|_| RpcError::Timeout(timeout))?
    }
}
