//! Length-prefixed frame codec.
//!
//! Implements the wire shape:
//! ```text
//! ┌────────────────────┬──────────────────────────┐
//! │ Total length       │ Payload                  │
//! │ 4 bytes, uint32 BE │ total length - 4 bytes   │
//! └────────────────────┴──────────────────────────┘
//! ```
//!
//! The length field counts itself, so an empty payload is framed as
//! `00 00 00 04`.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::error::{FramingError, Result};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default maximum payload size (10MB).
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Parser state of a [`FrameCodec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    /// Waiting for the 4-byte length prefix.
    ReadLength,
    /// Prefix consumed, waiting for `payload_length` bytes.
    ReadPayload {
        /// Bytes still owed for the current frame.
        payload_length: usize,
    },
}

/// Sans-I/O codec turning a byte stream into frames and payloads into
/// length-prefixed frames.
///
/// # Example
///
/// ```
/// use seqwire_framing::FrameCodec;
///
/// let mut codec = FrameCodec::new();
/// let framed = codec.encode(b"ABCD").unwrap();
/// assert_eq!(&framed[..], &[0, 0, 0, 8, b'A', b'B', b'C', b'D']);
///
/// assert!(codec.decode(&framed[..4]).unwrap().is_empty());
/// assert!(codec.decode(&framed[4..7]).unwrap().is_empty());
/// let frames = codec.decode(&framed[7..]).unwrap();
/// assert_eq!(&frames[0][..], b"ABCD");
/// ```
#[derive(Debug)]
pub struct FrameCodec {
    buffer: BytesMut,
    state: ParserState,
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a new frame codec.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            state: ParserState::ReadLength,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with custom max frame size.
    #[must_use]
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Maximum payload size accepted in either direction.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Current parser state.
    #[must_use]
    pub const fn state(&self) -> ParserState {
        self.state
    }

    /// Number of bytes retained for the next feed.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop retained bytes and go back to reading a length prefix.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = ParserState::ReadLength;
    }

    /// Feed newly received bytes and collect every frame they complete.
    ///
    /// Bytes that do not yet form a whole frame stay buffered for the next
    /// call, whatever the split point. On a corrupt length prefix the frames
    /// completed earlier in the same feed are discarded; use
    /// [`FrameCodec::decode_into`] to keep them.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::EmptyInput`] if `input` is empty, and a
    /// fatal framing error if a length prefix is invalid.
    pub fn decode(&mut self, input: &[u8]) -> Result<Vec<Bytes>> {
        let mut frames = Vec::new();
        self.decode_into(input, &mut frames)?;
        Ok(frames)
    }

    /// Like [`FrameCodec::decode`], appending frames to `frames` as they
    /// complete. Returns how many were appended.
    ///
    /// Frames that precede a corrupt length prefix are already in `frames`
    /// when the error is returned.
    ///
    /// # Errors
    ///
    /// Same as [`FrameCodec::decode`].
    pub fn decode_into(&mut self, input: &[u8], frames: &mut Vec<Bytes>) -> Result<usize> {
        if input.is_empty() {
            return Err(FramingError::EmptyInput);
        }

        self.buffer.extend_from_slice(input);

        let before = frames.len();
        while let Some(frame) = next_frame(&mut self.state, self.max_frame_size, &mut self.buffer)? {
            frames.push(frame);
        }

        Ok(frames.len() - before)
    }

    /// Frame a payload.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::FrameTooLarge`] if the payload exceeds the
    /// configured maximum.
    pub fn encode(&self, payload: &[u8]) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
        self.encode_into(payload, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Frame a payload, appending to `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::FrameTooLarge`] if the payload exceeds the
    /// configured maximum.
    pub fn encode_into(&self, payload: &[u8], buf: &mut BytesMut) -> Result<()> {
        let total_length = u32::try_from(payload.len() + LENGTH_PREFIX_SIZE)
            .ok()
            .filter(|_| payload.len() <= self.max_frame_size)
            .ok_or(FramingError::FrameTooLarge {
                size: payload.len(),
                max: self.max_frame_size,
            })?;

        buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
        buf.put_u32(total_length);
        buf.put_slice(payload);

        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Advance the state machine over `buf`, returning at most one frame.
fn next_frame(
    state: &mut ParserState,
    max_frame_size: usize,
    buf: &mut BytesMut,
) -> Result<Option<Bytes>> {
    loop {
        match *state {
            ParserState::ReadLength => {
                if buf.len() < LENGTH_PREFIX_SIZE {
                    return Ok(None);
                }

                let total_length = buf.get_u32();
                let payload_length = total_length
                    .checked_sub(LENGTH_PREFIX_SIZE as u32)
                    .ok_or(FramingError::LengthUnderflow {
                        total_length,
                        min: LENGTH_PREFIX_SIZE as u32,
                    })? as usize;

                if payload_length > max_frame_size {
                    return Err(FramingError::FrameTooLarge {
                        size: payload_length,
                        max: max_frame_size,
                    });
                }

                *state = ParserState::ReadPayload { payload_length };
            }

            ParserState::ReadPayload { payload_length } => {
                if buf.len() < payload_length {
                    buf.reserve(payload_length - buf.len());
                    return Ok(None);
                }

                let frame = buf.split_to(payload_length).freeze();
                *state = ParserState::ReadLength;
                trace!(len = payload_length, "frame complete");

                return Ok(Some(frame));
            }
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> std::result::Result<Option<Self::Item>, Self::Error> {
        next_frame(&mut self.state, self.max_frame_size, buf).map_err(Into::into)
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, payload: Bytes, buf: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        self.encode_into(&payload, buf).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes(payload: &[u8]) -> Vec<u8> {
        let mut bytes = ((payload.len() + LENGTH_PREFIX_SIZE) as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn test_encode_counts_prefix() {
        let codec = FrameCodec::new();
        let framed = codec.encode(b"ABCD").unwrap();
        assert_eq!(&framed[..], &[0x00, 0x00, 0x00, 0x08, 0x41, 0x42, 0x43, 0x44]);
    }

    #[test]
    fn test_three_feeds_yield_one_frame() {
        let mut codec = FrameCodec::new();

        assert!(codec.decode(&[0x00, 0x00, 0x00, 0x08]).unwrap().is_empty());
        assert_eq!(codec.state(), ParserState::ReadPayload { payload_length: 4 });

        assert!(codec.decode(b"ABC").unwrap().is_empty());
        assert_eq!(codec.buffered_len(), 3);

        let frames = codec.decode(b"D").unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"ABCD");
        assert_eq!(codec.state(), ParserState::ReadLength);
        assert_eq!(codec.buffered_len(), 0);
    }

    #[test]
    fn test_multiple_frames_in_one_feed() {
        let mut codec = FrameCodec::new();
        let mut data = frame_bytes(b"first");
        data.extend(frame_bytes(b"second"));
        data.extend(frame_bytes(b"third"));

        let frames = codec.decode(&data).unwrap();

        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[0][..], b"first");
        assert_eq!(&frames[1][..], b"second");
        assert_eq!(&frames[2][..], b"third");
    }

    #[test]
    fn test_complete_frame_then_partial_header() {
        let mut codec = FrameCodec::new();
        let first = frame_bytes(b"one");
        let second = frame_bytes(b"two");

        let mut data = first.clone();
        data.extend_from_slice(&second[..2]);

        let frames = codec.decode(&data).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(codec.state(), ParserState::ReadLength);
        assert_eq!(codec.buffered_len(), 2);

        let frames = codec.decode(&second[2..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"two");
    }

    #[test]
    fn test_empty_payload_frame() {
        let mut codec = FrameCodec::new();
        let frames = codec.decode(&[0, 0, 0, 4]).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_empty());
    }

    #[test]
    fn test_length_below_prefix_rejected() {
        let mut codec = FrameCodec::new();
        let err = codec.decode(&[0, 0, 0, 3]).unwrap_err();
        assert_eq!(
            err,
            FramingError::LengthUnderflow {
                total_length: 3,
                min: 4
            }
        );
    }

    #[test]
    fn test_frames_before_corrupt_prefix_are_kept() {
        let mut codec = FrameCodec::new();
        let mut data = frame_bytes(b"reply");
        data.extend_from_slice(&[0, 0, 0, 2]);

        let mut frames = Vec::new();
        let err = codec.decode_into(&data, &mut frames).unwrap_err();

        assert!(err.is_stream_corrupt());
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"reply");
    }

    #[test]
    fn test_empty_input_rejected() {
        let mut codec = FrameCodec::new();
        assert_eq!(codec.decode(&[]).unwrap_err(), FramingError::EmptyInput);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = FrameCodec::new().with_max_frame_size(16);
        let err = codec.decode(&1000u32.to_be_bytes()).unwrap_err();
        assert!(matches!(err, FramingError::FrameTooLarge { size: 996, max: 16 }));

        assert!(codec.encode(&[0u8; 17]).is_err());
        assert!(codec.encode(&[0u8; 16]).is_ok());
    }

    #[test]
    fn test_reset_discards_partial_frame() {
        let mut codec = FrameCodec::new();
        codec.decode(&[0, 0, 0, 10, 1, 2]).unwrap();
        codec.reset();

        assert_eq!(codec.state(), ParserState::ReadLength);
        assert_eq!(codec.buffered_len(), 0);

        let frames = codec.decode(&frame_bytes(b"ok")).unwrap();
        assert_eq!(&frames[0][..], b"ok");
    }

    #[test]
    fn test_tokio_decoder_shares_state_machine() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&frame_bytes(b"hello")[..7]);

        assert!(Decoder::decode(&mut codec, &mut buf).unwrap().is_none());
        buf.extend_from_slice(b"lo");
        let frame = Decoder::decode(&mut codec, &mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"hello");

        let mut out = BytesMut::new();
        Encoder::encode(&mut codec, Bytes::from_static(b"hello"), &mut out).unwrap();
        assert_eq!(&out[..], &frame_bytes(b"hello")[..]);
    }

    #[test]
    fn test_decoder_error_is_invalid_data() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 1][..]);
        let err = Decoder::decode(&mut codec, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
