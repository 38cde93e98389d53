//! Error types for the zkbridge relay.

use std::io;

use thiserror::Error;

/// Errors raised outside the per-stage pipeline faults.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to load or validate configuration.
    #[error("config error: {0}")]
    Config(String),

    /// JSON-RPC call failed.
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Signer could not be constructed.
    #[error("signer error: {0}")]
    Signer(String),

    /// Failed to (de)serialize JSON.
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// I/O error (job log, prover work directory).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TOML parsing error.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml_edit::de::Error),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
