//! Resource pool error types

use buildfleet_config::ConfigError;
use thiserror::Error;

/// Resource pool errors
#[derive(Error, Debug)]
pub enum PoolError {
    /// Malformed `remote_hosts` configuration. Not retryable.
    #[error("Invalid remote host configuration: {0}")]
    Config(#[from] ConfigError),

    /// Release of a lease that the ledger does not know about.
    #[error("No lease held on {host} for {prid}")]
    NotLeased { host: String, prid: String },

    #[error("Slot ledger error: {0}")]
    StateError(String),

    #[error("Slot ledger lock failed: {0}")]
    LockError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PoolError>;
