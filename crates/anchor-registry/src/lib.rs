//! anchor-registry — who is out there, and which one to call.
//!
//! The [`ServiceRegistry`] keeps one TTL-backed record per instance in the
//! coordination store. Discovery layers a per-service cache over it and a
//! registry-prefix watch that invalidates the cache as records change.
//!
//! # Architecture
//!
//! ```text
//! ServiceRegistry            register / heartbeat / status / sweep
//!   └── BasicDiscovery       one registry scan per call
//!         └── CachedDiscovery          TTL cache, single-flight misses
//!               └── WatchableCachedDiscovery   prefix watch invalidation
//!
//! InstanceSelector           round-robin / random / sticky
//! ```

pub mod discovery;
pub mod error;
pub mod registry;

pub use discovery::{
    BasicDiscovery, CacheStats, CachedDiscovery, InstanceSelector, SelectionStrategy,
    ServiceDiscovery, WatchableCachedDiscovery, leaders_only,
};
pub use error::{RegistryError, RegistryResult};
pub use registry::ServiceRegistry;
