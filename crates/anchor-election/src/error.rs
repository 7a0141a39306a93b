//! Error types for election and service lifecycle operations.

use anchor_core::ConfigError;
use anchor_registry::RegistryError;
use anchor_store::StoreError;
use thiserror::Error;

pub type ElectionResult<T> = Result<T, ElectionError>;

#[derive(Debug, Error)]
pub enum ElectionError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("corrupt lease record at {key}: {reason}")]
    CorruptLease { key: String, reason: String },

    #[error("service already started")]
    AlreadyStarted,
}

/// Fatal outcome of the heartbeat monitor.
#[derive(Debug, Clone, Error)]
pub enum MonitorError {
    #[error("coordination store unavailable for {failures} consecutive polls: {last_error}")]
    StoreUnavailable { failures: u32, last_error: String },
}
