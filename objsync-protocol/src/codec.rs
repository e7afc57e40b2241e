//! Encoder and decoder for framed messages.

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::message::Message;
use bytes::{Bytes, BytesMut};

/// Encodes messages into frames.
pub struct Encoder;

impl Encoder {
    /// Encodes a message into a frame.
    pub fn encode_message(message: &Message) -> Result<BytesMut, ProtocolError> {
        let frame = Frame::from_json(message)?;
        frame.encode()
    }

    /// Encodes any JSON-serializable value into a frame.
    pub fn encode_json<T: serde::Serialize>(value: &T) -> Result<BytesMut, ProtocolError> {
        let frame = Frame::from_json(value)?;
        frame.encode()
    }
}

/// Accumulates partial reads and yields complete frames.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends bytes to the internal buffer.
    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer)
    }

    /// Attempts to decode the next message from the buffer.
    pub fn decode_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        match self.decode_frame()? {
            Some(frame) => Ok(Some(Message::from_slice(&frame.payload)?)),
            None => Ok(None),
        }
    }

    /// Called when the stream reached EOF. Fails if a frame was cut short.
    pub fn finish(&self) -> Result<(), ProtocolError> {
        if self.buffer.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::TruncatedFrame {
                buffered: self.buffer.len(),
            })
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_decoder_roundtrip() {
        let message = Message::ObjectQuery {
            identifier: "Root".to_string(),
        };
        let encoded = Encoder::encode_message(&message).unwrap();

        let mut decoder = Decoder::new();
        decoder.extend(&encoded);

        let decoded = decoder.decode_message().unwrap().unwrap();
        assert_eq!(decoded, message);
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn test_partial_frame_decoding() {
        let message = Message::Sync { serial: 7 };
        let encoded = Encoder::encode_message(&message).unwrap();

        let mut decoder = Decoder::new();

        decoder.extend(&encoded[..10]);
        assert!(decoder.decode_message().unwrap().is_none());
        assert!(matches!(
            decoder.finish(),
            Err(ProtocolError::TruncatedFrame { buffered: 10 })
        ));

        decoder.extend(&encoded[10..]);
        assert_eq!(decoder.decode_message().unwrap().unwrap(), message);
    }

    #[test]
    fn test_byte_at_a_time() {
        let first = Message::ObjectRef {
            identifier: "a".to_string(),
        };
        let second = Message::ObjectDeref {
            identifier: "a".to_string(),
        };
        let mut wire = Encoder::encode_message(&first).unwrap().to_vec();
        wire.extend_from_slice(&Encoder::encode_message(&second).unwrap());

        let mut decoder = Decoder::new();
        let mut decoded = Vec::new();
        for byte in wire {
            decoder.extend(&[byte]);
            while let Some(message) = decoder.decode_message().unwrap() {
                decoded.push(message);
            }
        }
        assert_eq!(decoded, vec![first, second]);
    }

    #[test]
    fn test_unknown_command_is_error() {
        let encoded = Encoder::encode_json(&serde_json::json!({"command": "NOPE"})).unwrap();
        let mut decoder = Decoder::new();
        decoder.extend(&encoded);
        assert!(matches!(
            decoder.decode_message(),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn test_decoder_buffered() {
        let mut decoder = Decoder::new();
        assert_eq!(decoder.buffered(), 0);

        decoder.extend(b"12 some");
        assert_eq!(decoder.buffered(), 7);

        decoder.clear();
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_extend_bytes() {
        let encoded = Encoder::encode_message(&Message::SyncAck { serial: 1 }).unwrap();

        let mut decoder = Decoder::default();
        decoder.extend_bytes(Bytes::from(encoded.to_vec()));

        let decoded = decoder.decode_message().unwrap().unwrap();
        assert_eq!(decoded, Message::SyncAck { serial: 1 });
    }
}
