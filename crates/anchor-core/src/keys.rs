//! Coordination store key layout.
//!
//! Leader keys and registry keys live in separate namespaces so that the
//! election repository and the service registry each own a keyspace and
//! never write into the other's.

use crate::error::{ConfigError, ConfigResult};

/// Root namespace for leader keys.
pub const ELECTION_ROOT: &str = "anchor/election/";

/// Root namespace for registry records.
pub const REGISTRY_ROOT: &str = "anchor/registry/";

/// Check that `value` can stand as one path segment of a key. A `/` would
/// let one service's prefix cover another's records.
pub fn check_segment(field: &'static str, value: &str) -> ConfigResult<()> {
    if value.is_empty() || value.contains('/') {
        return Err(ConfigError::KeySegment {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Leader key for a `(service, group)` pair.
pub fn leader_key(service_name: &str, group_id: &str) -> String {
    format!("{ELECTION_ROOT}{service_name}/{group_id}")
}

/// Registry record key for a single instance.
pub fn registry_key(service_name: &str, instance_id: &str) -> String {
    format!("{REGISTRY_ROOT}{service_name}/{instance_id}")
}

/// Prefix covering every registry record of one service.
pub fn registry_prefix(service_name: &str) -> String {
    format!("{REGISTRY_ROOT}{service_name}/")
}

/// Split a registry key back into `(service_name, instance_id)`.
pub fn parse_registry_key(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix(REGISTRY_ROOT)?;
    let (service, instance) = rest.split_once('/')?;
    if service.is_empty() || instance.is_empty() {
        return None;
    }
    Some((service, instance))
}
