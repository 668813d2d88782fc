//! Error types for the WebSocket client engine.
//!
//! Errors fall into two families with different delivery paths: wire-level
//! violations (protocol, payload) are answered with a Close frame carrying
//! the matching close code, while local failures (configuration, network,
//! TLS, handshake, resource) surface through the error callback or as the
//! return value of the operation that failed.

use thiserror::Error;

/// Result type alias for WebSocket client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during WebSocket client operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The configured URL is missing, malformed, or uses an unsupported scheme.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// DNS resolution, connect, or transport I/O failed.
    #[error("Network error: {0}")]
    Network(String),

    /// TLS handshake or certificate handling failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The HTTP Upgrade exchange was rejected or malformed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Peer violated RFC 6455 framing rules. Answered on the wire with
    /// close code 1002.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Invalid UTF-8 in a text message or close reason.
    #[error("Invalid UTF-8 in text payload")]
    InvalidUtf8,

    /// Inflating a permessage-deflate payload failed. Answered on the wire
    /// with close code 1007.
    #[error("Decompression failed: {0}")]
    Decompression(String),

    /// Compressing an outgoing payload failed; the message is sent
    /// uncompressed instead and this error is only logged.
    #[error("Compression failed: {0}")]
    Compression(String),

    /// A reassembled or inflated message exceeded the configured maximum.
    /// Answered on the wire with close code 1009.
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge {
        /// Actual message size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// An opcode outside {0x0, 0x1, 0x2, 0x8, 0x9, 0xA} was received.
    #[error("Reserved opcode: {0:#x}")]
    ReservedOpcode(u8),

    /// A close frame carried a code that must not appear on the wire.
    #[error("Invalid close code: {0}")]
    InvalidCloseCode(u16),

    /// The bounded send queue is full; the submission was not enqueued.
    #[error("Send queue full ({capacity} items)")]
    SendQueueFull {
        /// The fixed queue capacity.
        capacity: usize,
    },

    /// The connection is not in a state that accepts this operation.
    #[error("Not connected")]
    NotConnected,

    /// The I/O thread could not be started or another internal invariant
    /// failed.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Network(err.to_string())
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(_: std::str::Utf8Error) -> Self {
        Error::InvalidUtf8
    }
}
