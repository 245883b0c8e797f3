//! Frame codec for varint length-prefixed framing.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - 1-10 bytes: body length L as an unsigned LEB128 varint
//! - L bytes: body (an encoded [`Envelope`](crate::Envelope))
//!
//! There is no magic, checksum or compression: the transport underneath is a
//! TLS or plain TCP byte stream and is trusted to deliver bytes in order.
//!
//! # Partial input
//!
//! Decoding is restartable. When the buffer holds only part of a prefix or
//! part of a body, the decoder reports that more data is needed and consumes
//! nothing, so the caller appends the next read and tries again.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};
use crate::varint::{decode_varint, encode_varint, encoded_len};

/// Default maximum frame body size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Most the decoder reserves ahead of a partially received body.
const RESERVE_AHEAD: usize = 64 * 1024;

/// A single frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The body bytes, without the length prefix.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame with the given body.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Length of the body in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the body is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Encoder and decoder for frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    /// Largest body accepted in either direction.
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a new frame codec with the default size limit.
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a frame codec with a custom body size limit.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// The configured body size limit.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a frame into bytes.
    pub fn encode(&self, frame: &Frame) -> Result<Bytes> {
        let mut output = BytesMut::new();
        self.encode_into(&frame.payload, &mut output)?;
        Ok(output.freeze())
    }

    /// Append the framed form of `body` to `output`.
    pub fn encode_into(&self, body: &[u8], output: &mut BytesMut) -> Result<()> {
        if body.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: body.len() as u64,
                max: self.max_frame_size,
            });
        }

        let length = body.len() as u64;
        output.reserve(encoded_len(length) + body.len());
        encode_varint(length, output);
        output.extend_from_slice(body);
        Ok(())
    }

    /// Decode a complete frame from the start of `data`.
    ///
    /// Unlike [`try_decode`](Self::try_decode) this treats a short buffer as
    /// an error, which suits callers holding a whole message in memory.
    pub fn decode(&self, data: &[u8]) -> Result<(Frame, usize)> {
        match self.try_decode(data)? {
            Some(decoded) => Ok(decoded),
            None => Err(ProtocolError::Deserialization(format!(
                "insufficient data for frame: have {} bytes",
                data.len()
            ))),
        }
    }

    /// Try to decode a frame from bytes, returning None if there isn't enough data.
    ///
    /// On success returns the frame and the number of bytes it occupied
    /// (prefix plus body).
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(Frame, usize)>> {
        let Some((length, prefix_len)) = decode_varint(data)? else {
            return Ok(None);
        };
        let body_len = self.check_length(length)?;

        let total = prefix_len + body_len;
        if data.len() < total {
            return Ok(None);
        }

        let body = Bytes::copy_from_slice(&data[prefix_len..total]);
        Ok(Some((Frame { payload: body }, total)))
    }

    /// Decode the next frame out of a growable read buffer.
    ///
    /// Consumes the frame's bytes from `buffer` only when the whole frame is
    /// present. The body is split off without copying.
    pub fn decode_buf(&self, buffer: &mut BytesMut) -> Result<Option<Frame>> {
        let Some((length, prefix_len)) = decode_varint(&buffer[..])? else {
            return Ok(None);
        };
        let body_len = self.check_length(length)?;

        if buffer.len() < prefix_len + body_len {
            // The prefix is unauthenticated; grow with the data, not the claim
            let missing = prefix_len + body_len - buffer.len();
            buffer.reserve(missing.min(RESERVE_AHEAD));
            return Ok(None);
        }

        buffer.advance(prefix_len);
        let body = buffer.split_to(body_len).freeze();
        Ok(Some(Frame { payload: body }))
    }

    fn check_length(&self, length: u64) -> Result<usize> {
        if length > self.max_frame_size as u64 {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }
        Ok(length as usize)
    }
}
