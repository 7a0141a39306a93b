//! anchor-core — shared types for the Anchor coordination runtime.
//!
//! Holds the domain model that every other crate speaks: service instances
//! and their status, the retry policy used by the resilient call path,
//! failover policy presets, the coordination-store key layout, and the
//! `anchor.toml` configuration parser.

pub mod config;
pub mod error;
pub mod keys;
pub mod policy;
pub mod retry;
pub mod time;
pub mod types;

pub use config::AnchorConfig;
pub use error::{ConfigError, ConfigResult};
pub use policy::{FailoverPolicy, FailoverTimings};
pub use retry::RetryPolicy;
pub use types::*;
