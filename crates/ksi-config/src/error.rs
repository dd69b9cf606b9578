//! Configuration error types.

use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("cannot read config file {path}: {source}")]
    Read {
        /// File that failed to read.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The config file is not valid TOML for [`crate::DaemonConfig`].
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        /// File that failed to parse.
        path: String,
        /// Underlying TOML error.
        source: toml::de::Error,
    },

    /// The merged configuration failed a validation rule.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
