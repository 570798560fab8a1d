//! Configuration errors

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    FileReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot write {path}: {source}")]
    FileWriteError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Cannot serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// An environment override that does not parse
    #[error("Bad value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Invalid configuration: {0}")]
    ValidationFailed(String),
}
