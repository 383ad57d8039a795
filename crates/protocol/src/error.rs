//! Error types for the protocol crate.

use thiserror::Error;

/// Failure to turn incoming bytes into an [`Envelope`](crate::Envelope).
///
/// Sessions never terminate on these; the offending message is dropped.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The bytes are not a JSON envelope, or carry an unknown `type`.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// A resize carried a zero dimension.
    #[error("invalid terminal size: {cols}x{rows}")]
    InvalidSize {
        /// Requested columns.
        cols: u16,
        /// Requested rows.
        rows: u16,
    },
}

/// Failure to serialize an envelope.
#[derive(Debug, Error)]
#[error("failed to encode envelope: {0}")]
pub struct EncodeError(#[from] serde_json::Error);

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        DecodeError::Malformed(err.to_string())
    }
}
