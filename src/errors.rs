//! Error types for the coordinator crate.
//!
//! - [`ConfigError`]: startup validation; fatal before any connector starts
//! - [`CacheError`]: backend failures surfaced to the caller
//! - [`FormulaError`]: formula registration / compilation failures
//!
//! Connector-level errors (`ProtocolError`, `FetchError`) live with the
//! connector that produces them.

use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A semantically invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Unknown connector kind '{kind}' for platform {platform}")]
    UnknownConnectorKind { platform: String, kind: String },

    #[error("Dependency cycle detected involving {0}")]
    DependencyCycle(String),

    #[error("Invalid formula for {target}: {source}")]
    Formula {
        target: String,
        #[source]
        source: FormulaError,
    },

    #[error("Cache backend unavailable: {0}")]
    Cache(#[from] CacheError),
}

/// Errors surfaced by a rate cache backend.
///
/// The local backend never fails; the shared-store backend reports
/// transient unavailability here instead of panicking.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("Quote serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Errors raised when registering a formula.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FormulaError {
    #[error("Unsupported formula language: {0}")]
    UnsupportedLanguage(String),

    #[error("Unknown native formula: {0}")]
    UnknownNative(String),

    #[error("Formula parse error at {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("Formula must define both bid and ask")]
    MissingSide,
}
