//! Configuration errors.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file does not exist
    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Config file could not be read
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML parse error
    #[error("invalid config syntax: {0}")]
    Parse(#[from] toml::de::Error),

    /// Semantic validation failure
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
