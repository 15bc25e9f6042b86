//! Error types for a replication link.

use deltalink_core::CoreError;
use deltalink_model::ModelError;
use deltalink_sync::SyncError;
use thiserror::Error;

/// Errors that can occur while setting up or running a link.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Codec error.
    #[error("codec error: {0}")]
    Core(#[from] CoreError),

    /// Model error.
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type for link operations.
pub type Result<T> = std::result::Result<T, LinkError>;
