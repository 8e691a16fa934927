//! Codec for encoding and decoding intents and events.
//!
//! Two encodings are supported on the same envelope structure:
//! - JSON in text frames (the default)
//! - MessagePack in binary frames, with a 4-byte big-endian length prefix

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::events::ServerEvent;
use crate::intents::ClientIntent;

/// Maximum frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Frame arrived in the wrong encoding for this connection.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Wire encoding negotiated for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Json,
    MessagePack,
}

impl Encoding {
    /// Parse an encoding name as given in the connect query string.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "json" => Some(Encoding::Json),
            "msgpack" | "messagepack" => Some(Encoding::MessagePack),
            _ => None,
        }
    }
}

/// A single transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    /// Size of the frame payload in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encode a value into a frame of the given encoding.
///
/// # Errors
///
/// Returns an error if the value is too large or serialization fails.
pub fn encode<T: Serialize>(value: &T, encoding: Encoding) -> Result<Frame, ProtocolError> {
    match encoding {
        Encoding::Json => {
            let text = serde_json::to_string(value)?;
            if text.len() > MAX_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge(text.len()));
            }
            Ok(Frame::Text(text))
        }
        Encoding::MessagePack => {
            let mut buf = BytesMut::new();
            encode_into(value, &mut buf)?;
            Ok(Frame::Binary(buf.freeze()))
        }
    }
}

/// Append a length-prefixed MessagePack value to an existing buffer.
///
/// # Errors
///
/// Returns an error if the value is too large or encoding fails.
pub fn encode_into<T: Serialize>(value: &T, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(value)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode a value from a frame.
///
/// Text frames are JSON; binary frames are length-prefixed MessagePack.
///
/// # Errors
///
/// Returns an error if the frame is incomplete, too large, or malformed.
pub fn decode<T: DeserializeOwned>(frame: &Frame) -> Result<T, ProtocolError> {
    match frame {
        Frame::Text(text) => {
            if text.len() > MAX_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge(text.len()));
            }
            Ok(serde_json::from_str(text)?)
        }
        Frame::Binary(data) => decode_binary(data),
    }
}

fn decode_binary<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?)
}

/// Try to decode a MessagePack value from a streaming buffer, advancing it
/// if successful.
///
/// Returns `Ok(None)` if more data is needed.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    if buf.len() < LENGTH_PREFIX_SIZE + length {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    Ok(Some(rmp_serde::from_slice(&payload)?))
}

/// Decode a client intent from a frame.
///
/// # Errors
///
/// Returns an error if the frame does not hold a known intent.
pub fn decode_intent(frame: &Frame) -> Result<ClientIntent, ProtocolError> {
    decode(frame)
}

/// Encode a server event in the given encoding.
///
/// # Errors
///
/// Returns an error if encoding fails.
pub fn encode_event(event: &ServerEvent, encoding: Encoding) -> Result<Frame, ProtocolError> {
    encode(event, encoding)
}
