//! Sans-I/O framing for a length-prefixed binary protocol.
//!
//! Every frame on the wire is a big-endian `u32` total length (which counts
//! the 4 length bytes themselves) followed by an opaque payload. This crate
//! knows nothing about what the payload contains.
//!
//! - [`FrameCodec`] turns arbitrarily chunked input into whole frames and
//!   frames outgoing payloads. It also implements the `tokio_util` codec
//!   traits for use with `FramedRead` / `FramedWrite`.
//! - [`BufferArena`] is a reusable receive buffer the transport reads into
//!   directly before the new bytes are handed to the codec.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod arena;
pub mod codec;
pub mod error;

pub use arena::{BufferArena, DEFAULT_SLACK};
pub use codec::{FrameCodec, LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE, ParserState};
pub use error::{FramingError, Result};

// Re-export dependencies that are part of our public API
pub use bytes::Bytes;
