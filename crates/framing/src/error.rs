//! Error types for the framing layer.

use thiserror::Error;

/// Result type alias for framing operations.
pub type Result<T> = std::result::Result<T, FramingError>;

/// Errors raised while splitting or building length-prefixed frames.
///
/// Every variant except [`FramingError::EmptyInput`] and
/// [`FramingError::CommitOutOfBounds`] means the inbound stream can no longer
/// be trusted and the connection carrying it must be torn down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    /// The length prefix is smaller than the prefix itself.
    #[error("Invalid length prefix {total_length}: must be at least {min}")]
    LengthUnderflow {
        /// Raw value read from the wire.
        total_length: u32,
        /// Smallest acceptable value.
        min: u32,
    },

    /// The frame announces (or carries) more bytes than allowed.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Payload size in bytes.
        size: usize,
        /// Maximum allowed payload size.
        max: usize,
    },

    /// `decode` was called without any bytes.
    #[error("No data to decode")]
    EmptyInput,

    /// More bytes were committed than the last acquired region can hold.
    #[error("Committed {committed} bytes into a region of {available}")]
    CommitOutOfBounds {
        /// Bytes the caller claimed to have written.
        committed: usize,
        /// Size of the region that was handed out.
        available: usize,
    },
}

impl FramingError {
    /// Whether the inbound stream is unrecoverable after this error.
    ///
    /// Caller mistakes ([`Self::EmptyInput`], [`Self::CommitOutOfBounds`])
    /// leave the codec state untouched.
    #[must_use]
    pub const fn is_stream_corrupt(&self) -> bool {
        matches!(self, Self::LengthUnderflow { .. } | Self::FrameTooLarge { .. })
    }
}

impl From<FramingError> for std::io::Error {
    fn from(err: FramingError) -> Self {
        Self::new(std::io::ErrorKind::InvalidData, err)
    }
}
