//! Transport and endpoint ports.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::RpcResult;

/// Where a request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTarget {
    /// Any instance of the service; the transport picks one.
    Service(String),
    Instance { service: String, instance_id: String },
}

impl CallTarget {
    pub fn service(&self) -> &str {
        match self {
            CallTarget::Service(service) => service,
            CallTarget::Instance { service, .. } => service,
        }
    }
}

impl fmt::Display for CallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallTarget::Service(service) => write!(f, "{service}"),
            CallTarget::Instance { service, instance_id } => write!(f, "{service}/{instance_id}"),
        }
    }
}

/// Request/reply transport. Every request carries an explicit timeout.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(
        &self,
        target: &CallTarget,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> RpcResult<Value>;
}

pub type SharedTransport = Arc<dyn Transport>;

/// A peer that answers requests.
#[async_trait]
pub trait RpcEndpoint: Send + Sync {
    fn service_name(&self) -> &str;
    fn instance_id(&self) -> &str;
    async fn handle(&self, method: &str, params: Value) -> RpcResult<Value>;
}
