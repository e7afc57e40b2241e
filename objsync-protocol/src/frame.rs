//! Length-prefixed text frames.
//!
//! Frame layout:
//!
//! ```text
//! +------------------+-------+-----------------+------+
//! | length (decimal) | ' '   | payload         | '\n' |
//! | 1..=10 digits    | 1 byte| length bytes    |1 byte|
//! +------------------+-------+-----------------+------+
//! ```
//!
//! The terminator is located by counting, never by scanning, so payloads
//! may contain newline bytes.

use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Maximum number of digits accepted in a length prefix.
pub const MAX_LENGTH_DIGITS: usize = 10;

const SEPARATOR: u8 = b' ';
const TERMINATOR: u8 = b'\n';

/// A single framed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame payload (JSON data).
    pub payload: Bytes,
}

impl Frame {
    /// Creates a new frame with the given payload.
    pub fn new(payload: Bytes) -> Self {
        Self { payload }
    }

    /// Creates a new frame from a JSON-serializable value.
    pub fn from_json<T: serde::Serialize>(value: &T) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(Bytes::from(payload)))
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let len = self.payload.len();
        if len == 0 {
            return Err(ProtocolError::EmptyPayload);
        }
        if len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let prefix = len.to_string();
        let mut buf = BytesMut::with_capacity(prefix.len() + len + 2);
        buf.put_slice(prefix.as_bytes());
        buf.put_u8(SEPARATOR);
        buf.put_slice(&self.payload);
        buf.put_u8(TERMINATOR);
        Ok(buf)
    }

    /// Decodes a frame from bytes.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on protocol errors.
    /// Consumed bytes are removed from `buf`; on `Ok(None)` it is untouched.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        let search = buf.len().min(MAX_LENGTH_DIGITS + 1);
        let separator = buf[..search].iter().position(|&b| b == SEPARATOR);

        let Some(head) = separator else {
            // No separator yet: reject early if what we have can't be a length.
            if let Some(pos) = buf[..search].iter().position(|b| !b.is_ascii_digit()) {
                return Err(ProtocolError::InvalidLength(lossy(&buf[..=pos])));
            }
            if buf.len() > MAX_LENGTH_DIGITS {
                return Err(ProtocolError::InvalidLength(lossy(&buf[..search])));
            }
            return Ok(None);
        };

        if head == 0 {
            return Err(ProtocolError::MissingLength);
        }

        let digits = &buf[..head];
        if !digits.iter().all(u8::is_ascii_digit) {
            return Err(ProtocolError::InvalidLength(lossy(digits)));
        }
        // At most MAX_LENGTH_DIGITS ASCII digits, which always fits in a u64.
        let len = digits
            .iter()
            .fold(0u64, |acc, d| acc * 10 + u64::from(d - b'0'));
        if len == 0 {
            return Err(ProtocolError::ZeroLength);
        }
        if len > MAX_PAYLOAD_SIZE as u64 {
            return Err(ProtocolError::FrameTooLarge {
                size: len as usize,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let len = len as usize;

        let total = head + 1 + len + 1;
        if buf.len() < total {
            return Ok(None);
        }

        let terminator = buf[total - 1];
        if terminator != TERMINATOR {
            return Err(ProtocolError::MissingTerminator(terminator));
        }

        buf.advance(head + 1);
        let payload = buf.split_to(len).freeze();
        buf.advance(1);

        Ok(Some(Self { payload }))
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
