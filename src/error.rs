//! Error types for sockwire.

use thiserror::Error;

/// Errors produced by the value codec while reading or writing packets.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Tried to read past the end of the received buffer.
    #[error("read past end of buffer")]
    UnexpectedEnd,

    /// Encountered a type tag the decoder does not recognize.
    #[error("invalid type tag: {0}")]
    InvalidTag(u8),

    /// String bytes were not valid UTF-8.
    #[error("invalid utf-8 in string")]
    InvalidUtf8,

    /// A string back-reference pointed outside the string table.
    #[error("invalid string table reference: {0}")]
    InvalidStringRef(u64),
}

/// Main error type for all sockwire operations.
#[derive(Debug, Error)]
pub enum SockwireError {
    /// I/O error from the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (textual frame path).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed or unsupported bytes/values in the binary codec.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Malformed frame shape or unknown method index.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Call refused by a per-method rate-limit window.
    #[error("rate limit exceeded")]
    RateLimit,

    /// Call attempted while the session is not connected.
    #[error("not connected")]
    NotConnected,

    /// Pending call invalidated by connection loss.
    #[error("disconnected")]
    Disconnected,

    /// The remote side rejected a promise call with this message.
    #[error("{0}")]
    Rejected(String),

    /// Method table exceeds the index space left by reserved control codes.
    #[error("too many methods")]
    TooManyMethods,

    /// A broadcast target was not a connection-bound client proxy.
    #[error("invalid client")]
    InvalidClient,

    /// Exception raised by a user-supplied handler body.
    #[error("handler error: {0}")]
    Handler(String),

    /// Failure reported by the underlying transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// Connection closed unexpectedly.
    #[error("connection closed")]
    ConnectionClosed,
}

/// Result type alias using SockwireError.
pub type Result<T> = std::result::Result<T, SockwireError>;
