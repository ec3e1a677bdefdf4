//! Transport Errors

use std::time::Duration;

use thiserror::Error;

/// Low-level failures of the socket and its framing
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not establish the connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Peer closed the socket between frames
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// Peer closed the socket in the middle of a frame
    #[error("Connection closed mid-frame with {0} bytes buffered")]
    Truncated(usize),

    /// Payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// CRC32 of the payload did not match the header
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried in the frame header
        expected: u32,
        /// Checksum computed over the received payload
        actual: u32,
    },

    /// Declared frame length exceeds the maximum; the stream cannot be resynchronized
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Declared payload length
        size: usize,
        /// Maximum accepted payload length
        max: usize,
    },

    /// Operation did not complete in time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Peer sent something the protocol does not allow at this point
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Underlying I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the transport is unusable after this error
    ///
    /// Checksum and payload errors only affect the frame they occurred in,
    /// and a timeout leaves the socket intact.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::SerializationError(_) | Self::Timeout(_)
        )
    }
}
