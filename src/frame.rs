// ABOUTME: Defines the wire frame used by the remote-execution protocol
// ABOUTME: header, and the stateless codec that parses/encodes it

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the fixed frame header: one command byte plus a little-endian
/// `u16` payload length.
pub const HEADER_LEN: usize = 3;

/// Largest payload a single frame may carry.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Errors that can occur while encoding a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The payload is larger than a single frame can carry.
    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD_LEN} byte frame limit")]
    PayloadTooLarge(usize),

    /// The destination buffer has no room for this frame.
    #[error("output buffer has no space for a {0} byte frame")]
    NoSpace(usize),
}

/// One parsed frame: a command byte and its payload.
///
/// `payload` is a cheap `Bytes` slice of the buffer it was parsed from, not
/// a copy, until the caller chooses to keep it past the buffer's lifetime
/// (which `Bytes`'s refcounting makes free to do).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u8,
    pub payload: Bytes,
}

/// Parses frames out of a session's receive buffer and serializes frames
/// into its send buffer. Holds no state of its own.
pub struct FrameCodec;

impl FrameCodec {
    /// Attempts to parse one frame from the head of `buf`.
    ///
    /// Returns `Ok(None)` if fewer than [`HEADER_LEN`] bytes, or fewer than
    /// a full frame, are buffered yet. On success the consumed bytes are
    /// drained from the front of `buf`.
    pub fn try_parse(buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let command = buf[0];
        let payload_len = u16::from_le_bytes([buf[1], buf[2]]) as usize;
        let total_len = HEADER_LEN + payload_len;

        if buf.len() < total_len {
            return Ok(None);
        }

        let mut frame_bytes = buf.split_to(total_len);
        frame_bytes.advance(HEADER_LEN);

        Ok(Some(Frame {
            command,
            payload: frame_bytes.freeze(),
        }))
    }

    /// Appends one frame to the tail of `buf`, refusing if it would push
    /// `buf` past `capacity`.
    pub fn encode(
        command: u8,
        payload: &[u8],
        buf: &mut BytesMut,
        capacity: usize,
    ) -> Result<(), CodecError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(CodecError::PayloadTooLarge(payload.len()));
        }

        let total_len = HEADER_LEN + payload.len();
        if buf.len() + total_len > capacity {
            return Err(CodecError::NoSpace(total_len));
        }

        buf.put_u8(command);
        buf.put_u16_le(payload.len() as u16);
        buf.put_slice(payload);

        Ok(())
    }
}
