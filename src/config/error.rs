//! Configuration error types.

use crate::netns::ValidationError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a configuration file.
    #[error("Failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the file that couldn't be read.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to write a configuration file.
    #[error("Failed to write config file {path}: {source}")]
    WriteError {
        /// Path to the file that couldn't be written.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse a TOML configuration file.
    #[error("Failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the file that couldn't be parsed.
        path: PathBuf,
        /// The underlying TOML parse error.
        source: toml::de::Error,
    },

    /// A required key has no value.
    #[error("Missing required config key(s): {}", .0.join(", "))]
    MissingKeys(Vec<String>),

    /// A key that no component reads.
    #[error("Unknown config key: {0}")]
    UnknownKey(String),

    /// A configuration value is invalid.
    #[error(transparent)]
    InvalidValue(#[from] ValidationError),

    /// Failed to serialize configuration.
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
}
