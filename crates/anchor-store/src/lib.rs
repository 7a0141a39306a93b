//! anchor-store — the coordination store port and its adapters.
//!
//! The election repository, the service registry and discovery all talk to
//! the coordination store through [`CoordinationStore`]: get, conditional
//! put, delete, exists, prefix list and watch. The algorithms built on top
//! rely on three store guarantees: create-only and revision-checked writes
//! are atomic, TTL-bearing entries expire without an explicit delete, and a
//! watch delivers every change at least once while it is connected.
//!
//! # Architecture
//!
//! ```text
//! Arc<dyn CoordinationStore>
//!   ├── RedbStore        embedded redb, revisions, TTL, broadcast watch
//!   ├── TimedStore<S>    explicit per-operation timeout
//!   └── FaultyStore<S>   switchable unavailability for drills and tests
//!
//! ReconnectingWatch
//!   └── re-subscribes with backoff, emits Resync after every gap
//! ```
//!
//! `RedbStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`) and
//! one handle can be shared by every component of a process.

pub mod error;
pub mod fault;
pub mod port;
pub mod redb_store;
pub mod tables;
pub mod timed;
pub mod types;
pub mod watch;

pub use error::{StoreError, StoreResult};
pub use fault::FaultyStore;
pub use port::{CoordinationStore, SharedStore, WatchStream};
pub use redb_store::RedbStore;
pub use timed::TimedStore;
pub use types::*;
pub use watch::{ReconnectConfig, ReconnectingWatch, WatchNotice};
