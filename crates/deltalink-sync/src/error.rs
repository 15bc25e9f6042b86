//! Error types for the sync module.

use thiserror::Error;

/// Errors that can occur while replicating deltas.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Encoding or decoding a delta failed.
    #[error("codec error: {0}")]
    Core(#[from] deltalink_core::CoreError),

    /// The model rejected an operation.
    #[error("model error: {0}")]
    Model(#[from] deltalink_model::ModelError),

    /// Socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Role was neither `server` nor `client`.
    #[error("invalid role {0:?}, expected \"server\" or \"client\"")]
    InvalidRole(String),

    /// The worker thread has exited.
    #[error("worker {0} has stopped")]
    WorkerStopped(String),

    /// The adaptor was stopped; no further outgoing deltas.
    #[error("outgoing queue closed")]
    OutgoingClosed,

    /// A serialized delta would break line framing.
    #[error("serialized delta contains a newline")]
    EmbeddedNewline,

    /// Nobody listens at the peer address.
    #[error("connection refused by {0}")]
    ConnectionRefused(String),
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
