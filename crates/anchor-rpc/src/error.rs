//! RPC error taxonomy.

use std::time::Duration;

use anchor_core::ErrorKind;
use thiserror::Error;

pub type RpcResult<T> = Result<T, RpcError>;

#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("instance {instance_id} is not active for {method}")]
    NotActive { instance_id: String, method: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no instances available for {0}")]
    NoInstances(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("giving up after {retries} retries: {last}")]
    RetriesExhausted { retries: u32, last: Box<RpcError> },

    #[error("{0}")]
    InvalidPolicy(String),
}

impl RpcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::NotActive { .. } => ErrorKind::NotActive,
            RpcError::Timeout(_) => ErrorKind::Timeout,
            RpcError::Transport(_) => ErrorKind::Transport,
            RpcError::NoInstances(_) => ErrorKind::NoInstances,
            RpcError::MethodNotFound(_) => ErrorKind::MethodNotFound,
            RpcError::Handler(_) => ErrorKind::Handler,
            RpcError::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            RpcError::InvalidPolicy(_) => ErrorKind::InvalidPolicy,
        }
    }
}
