//! Error types for the model module.

use thiserror::Error;

/// Errors that can occur when reading or mutating a model.
#[derive(Debug, Error)]
pub enum ModelError {
    /// The model no longer accepts transactions.
    #[error("model is stopped")]
    Stopped,

    /// No object with this identity exists.
    #[error("unknown object: {0}")]
    UnknownObject(String),

    /// The property is not part of the model.
    #[error("unknown property: {0}")]
    UnknownProperty(String),

    /// A commit handler failed.
    #[error("commit handler failed: {0}")]
    Handler(String),
}

/// Result type for model operations.
pub type Result<T> = std::result::Result<T, ModelError>;
