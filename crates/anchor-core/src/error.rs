//! Configuration and validation errors.

use thiserror::Error;

/// Result type alias for config parsing and validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration '{0}' (expected e.g. \"500ms\", \"5s\", \"1m\")")]
    Duration(String),

    #[error("invalid version '{version}': {reason}")]
    Version { version: String, reason: String },

    #[error("invalid retry policy: {0}")]
    RetryPolicy(String),

    #[error("invalid election timings: {0}")]
    Timings(String),

    #[error("invalid {field} '{value}': must be non-empty and must not contain '/'")]
    KeySegment { field: &'static str, value: String },
}
