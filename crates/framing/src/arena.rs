//! Reusable receive buffer feeding a [`FrameCodec`].
//!
//! The transport reads straight into the region returned by
//! [`BufferArena::acquire_write_region`], then reports how many bytes landed
//! with [`BufferArena::commit_write`]. The committed slice is handed to the
//! codec in place; the arena never copies it.
//!
//! Cursor policy:
//! - no buffer yet, or `size_hint` larger than the whole buffer: allocate
//!   `size_hint + slack` bytes and start at 0;
//! - `size_hint` larger than what is left after the cursor, or cursor at the
//!   end: rewind to 0.
//!
//! Rewinding is sound because the codec retains every byte it has not turned
//! into a frame yet, so nothing before the cursor is still referenced.

use bytes::Bytes;

use crate::codec::FrameCodec;
use crate::error::{FramingError, Result};

/// Extra bytes allocated on top of the requested size.
pub const DEFAULT_SLACK: usize = 1000;

/// Reusable byte buffer with a write cursor.
#[derive(Debug)]
pub struct BufferArena {
    buffer: Vec<u8>,
    cursor: usize,
    /// Length of the region handed out by the last acquire, minus commits.
    available: usize,
    slack: usize,
}

impl BufferArena {
    /// Create an empty arena. Nothing is allocated until the first acquire.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_slack(DEFAULT_SLACK)
    }

    /// Create an empty arena with a custom allocation slack.
    #[must_use]
    pub const fn with_slack(slack: usize) -> Self {
        Self {
            buffer: Vec::new(),
            cursor: 0,
            available: 0,
            slack,
        }
    }

    /// Size of the backing buffer.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Current write cursor.
    #[must_use]
    pub const fn cursor(&self) -> usize {
        self.cursor
    }

    /// Return a writable window starting at the cursor.
    ///
    /// A `size_hint` of 0 asks for any non-empty region.
    pub fn acquire_write_region(&mut self, size_hint: usize) -> &mut [u8] {
        let wanted = size_hint.max(1);

        if self.buffer.is_empty() || wanted > self.buffer.len() {
            self.buffer = vec![0; wanted + self.slack];
            self.cursor = 0;
        } else if wanted > self.buffer.len() - self.cursor || self.cursor == self.buffer.len() {
            self.cursor = 0;
        }

        self.available = self.buffer.len() - self.cursor;
        &mut self.buffer[self.cursor..]
    }

    /// Advance the cursor by `n` and decode exactly the bytes just written.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::CommitOutOfBounds`] if `n` is larger than the
    /// region handed out, or whatever the codec reports for the new bytes.
    pub fn commit_write(&mut self, n: usize, codec: &mut FrameCodec) -> Result<Vec<Bytes>> {
        let mut frames = Vec::new();
        self.commit_write_into(n, codec, &mut frames)?;
        Ok(frames)
    }

    /// Like [`BufferArena::commit_write`], appending frames to `frames` so
    /// that those completed before a codec error are kept.
    ///
    /// # Errors
    ///
    /// Same as [`BufferArena::commit_write`].
    pub fn commit_write_into(
        &mut self,
        n: usize,
        codec: &mut FrameCodec,
        frames: &mut Vec<Bytes>,
    ) -> Result<usize> {
        if n > self.available {
            return Err(FramingError::CommitOutOfBounds {
                committed: n,
                available: self.available,
            });
        }

        let start = self.cursor;
        self.cursor += n;
        self.available -= n;

        codec.decode_into(&self.buffer[start..self.cursor], frames)
    }
}

impl Default for BufferArena {
    fn default() -> Self {
        Self::new()
    }
}
