//! Error types for deltalink core.

use thiserror::Error;

/// Errors raised while framing, encoding or decoding deltas.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A length-prefixed field could not be read.
    #[error("malformed frame at field {field}: {reason}")]
    MalformedFrame { field: usize, reason: String },

    /// A value has no string form.
    #[error("not serializable: {0}")]
    NotSerializable(String),

    /// A string could not be turned back into a value or identity.
    #[error("not deserializable: {0}")]
    NotDeserializable(String),

    /// The JSON stage failed to parse or emit.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    pub(crate) fn malformed(field: usize, reason: impl Into<String>) -> Self {
        CoreError::MalformedFrame {
            field,
            reason: reason.into(),
        }
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
