//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors produced while reading or writing framed messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// IO error on the underlying stream.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Body was not valid JSON, or not a valid JSON-RPC shape.
    #[error("invalid message body: {0}")]
    Json(#[from] serde_json::Error),

    /// Header block ended without a Content-Length header.
    #[error("missing Content-Length header")]
    MissingContentLength,

    /// Content-Length value was not a decimal byte count.
    #[error("invalid Content-Length value: {0:?}")]
    InvalidContentLength(String),

    /// The stream ended inside a header block or body.
    #[error("stream closed mid-frame")]
    UnexpectedEof,
}
