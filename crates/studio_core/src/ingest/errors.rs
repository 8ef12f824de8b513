//! Error types for change intake.

use thiserror::Error;

/// Errors that reject a whole notification.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    /// Missing or mismatched signature. Nothing in the body is trusted.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Sequence not after the source's watermark (replay or stale delivery).
    #[error("Discarded event from '{source_id}': sequence {sequence} is not after {watermark}")]
    DuplicateOrOutOfOrder {
        source_id: String,
        sequence: u64,
        watermark: u64,
    },

    /// Signed body that is not a valid change envelope.
    #[error("Malformed notification: {0}")]
    Malformed(String),

    /// No shared secret available to verify with.
    #[error("No shared secret configured (set ingest.shared_secret or ${0})")]
    MissingSecret(String),
}

impl IngestError {
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication(message.into())
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }

    /// Replays are expected and discarded quietly.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateOrOutOfOrder { .. })
    }
}

/// Result type for intake operations.
pub type IngestResult<T> = Result<T, IngestError>;

/// A single row that failed schema checks. Sibling rows are unaffected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Row '{row_key}' (#{index}): {message}")]
pub struct SchemaError {
    /// Position of the row in the notification.
    pub index: usize,
    pub row_key: String,
    pub message: String,
}

impl SchemaError {
    pub fn new(index: usize, row_key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            index,
            row_key: row_key.into(),
            message: message.into(),
        }
    }

    pub fn missing_fields(index: usize, row_key: impl Into<String>, fields: &[&str]) -> Self {
        Self::new(
            index,
            row_key,
            format!("missing required fields: {}", fields.join(", ")),
        )
    }
}
