//! Error types for registry operations.

use anchor_core::ConfigError;
use anchor_store::StoreError;
use thiserror::Error;

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid instance record: {0}")]
    Invalid(#[from] ConfigError),

    #[error("instance not registered: {service}/{instance_id}")]
    NotRegistered { service: String, instance_id: String },

    #[error("gave up writing {0} after repeated concurrent updates")]
    Contention(String),

    #[error("serialization error: {0}")]
    Serialize(String),
}

impl RegistryError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, RegistryError::Store(e) if e.is_unavailable())
    }
}
