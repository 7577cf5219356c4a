//! Error types for the bridge client.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for bridge client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for bridge client operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection-related errors.
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Protocol-level errors.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Codec errors during serialization/deserialization.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// An `err` frame, either sent by the bridge or synthesized from a frame
    /// that could not be decoded.
    #[error("Bridge error: {0}")]
    Bridge(String),

    /// Operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// A request ended without a reply message.
    #[error("Reply error: {0}")]
    Reply(#[from] ReplyError),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Channel closed unexpectedly.
    #[error("Channel closed")]
    ChannelClosed,
}

/// Connection-specific errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Failed to establish connection.
    #[error("Failed to connect to {addr}: {source}")]
    ConnectFailed {
        /// The `host:port` we tried to connect to.
        addr: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// No connection has been established, or it has been closed.
    #[error("Not connected")]
    NotConnected,

    /// The peer closed the connection.
    #[error("Connection closed by peer")]
    Closed,

    /// The connection failed while reading or writing.
    #[error("Connection reset: {0}")]
    Reset(#[source] io::Error),
}

/// Protocol-level errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame or line exceeds the configured limit.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the frame.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// A field required by the envelope type is absent.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// The envelope `type` is not one the protocol defines.
    #[error("Unknown envelope type: {0}")]
    UnknownType(String),
}

/// Codec-related errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("Failed to serialize: {0}")]
    SerializationFailed(String),

    /// Deserialization failed.
    #[error("Failed to deserialize: {0}")]
    DeserializationFailed(String),
}

/// Error handed to a reply callback instead of a reply message.
///
/// Application failures travel only on this path; they never reach the
/// connection-wide error hook.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ReplyError {
    /// The bridge answered with a failure reply.
    #[error("{failure_type} ({failure_code}): {message}")]
    Failure {
        /// Numeric failure code.
        failure_code: i64,
        /// Failure category, e.g. `NO_HANDLERS`, `TIMEOUT`, `RECIPIENT_FAILURE`.
        failure_type: String,
        /// Human-readable message.
        message: String,
    },

    /// No reply arrived before the deadline.
    #[error("No reply within {0:?}")]
    Timeout(Duration),

    /// The connection was closed while the reply was outstanding.
    #[error("Connection closed before reply arrived")]
    Closed,
}
