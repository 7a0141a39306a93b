//! anchor-election — sticky single-active leadership over a coordination store.
//!
//! One lease key per `(service, group)` decides which peer is active. The
//! [`ElectionRepository`] turns store races into booleans, the
//! [`HeartbeatMonitor`] watches the lease from standby peers, and the
//! [`SingleActiveService`] ties both to the registry and to the exclusive
//! handler dispatch.
//!
//! # Architecture
//!
//! ```text
//! SingleActiveService
//!   ├── ElectionRepository   try_acquire / renew / release
//!   ├── HeartbeatMonitor     standby: poll + watch, trigger on vacancy
//!   ├── ServiceRegistry      status mirror and registry heartbeat
//!   └── HandlerRegistry      exclusive methods gated on Active
//! ```

pub mod config;
pub mod error;
pub mod monitor;
pub mod repository;
pub mod service;

pub use config::ServiceConfig;
pub use error::{ElectionError, ElectionResult, MonitorError};
pub use monitor::{ElectionTrigger, HeartbeatMonitor, MonitorConfig, MonitorState};
pub use repository::{ElectionRepository, HeartbeatStatus, LeaseRecord};
pub use service::{Health, LeadershipListener, ServiceState, SingleActiveService};
