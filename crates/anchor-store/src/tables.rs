//! redb table definitions for the coordination store.
//!
//! Entries use `&str` keys and `&[u8]` values (JSON-serialized
//! `StoredEntry`). The meta table holds the store-wide revision counter.

use redb::TableDefinition;

/// Key-value entries keyed by the caller's key.
pub const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");

/// Store metadata (`revision` → last issued revision).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Meta key holding the last issued revision.
pub const REVISION_KEY: &str = "revision";
