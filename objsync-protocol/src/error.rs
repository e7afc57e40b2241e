//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors that can occur during framing or message handling.
///
/// Every variant is fatal to the connection that produced it: the stream is
/// reliable and ordered, so a malformed frame or message means the two sides
/// have lost agreement and there is nothing to resynchronize against.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is missing its length prefix")]
    MissingLength,

    #[error("invalid frame length prefix: {0:?}")]
    InvalidLength(String),

    #[error("frame length must be greater than zero")]
    ZeroLength,

    #[error("cannot encode an empty payload")]
    EmptyPayload,

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("frame terminator must be a newline, got byte {0:#04x}")]
    MissingTerminator(u8),

    #[error("stream closed with {buffered} bytes of an incomplete frame")]
    TruncatedFrame { buffered: usize },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns whether the error was caused by bytes the peer sent, as
    /// opposed to the transport itself failing.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            ProtocolError::MissingLength
                | ProtocolError::InvalidLength(_)
                | ProtocolError::ZeroLength
                | ProtocolError::FrameTooLarge { .. }
                | ProtocolError::MissingTerminator(_)
                | ProtocolError::TruncatedFrame { .. }
        )
    }
}
