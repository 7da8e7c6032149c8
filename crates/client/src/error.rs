//! Error types for the connection core.

use std::io;
use std::time::Duration;

use seqwire_framing::FramingError;
use thiserror::Error;

use crate::engine::{DecodeError, SequenceId};

/// Result type alias for connection operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for connection operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The inbound byte stream is malformed. Fatal to the connection.
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    /// A waiter is already registered for this sequence id.
    #[error("Duplicate request: sequence id {sequence_id} is already in flight")]
    DuplicateRequest {
        /// The colliding sequence id.
        sequence_id: SequenceId,
    },

    /// The request did not complete before its deadline.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The connection closed before the request completed.
    #[error("Connection closed{}", display_reason(.reason))]
    ConnectionClosed {
        /// Why the connection went away, if known.
        reason: Option<String>,
    },

    /// The connection is shutting down and accepts no new work.
    #[error("Connection is closing")]
    Closing,

    /// The request was cancelled through its cancellation token.
    #[error("Request cancelled")]
    Cancelled,

    /// The engine could not decode a frame.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Build a [`Error::ConnectionClosed`] from an optional reason.
    pub(crate) fn closed(reason: Option<&str>) -> Self {
        Self::ConnectionClosed {
            reason: reason.map(ToString::to_string),
        }
    }

    /// Whether this error leaves the connection unusable.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::Framing(err) => err.is_stream_corrupt(),
            Self::DuplicateRequest { .. } | Self::ConnectionClosed { .. } | Self::Io(_) => true,
            Self::Timeout(_) | Self::Closing | Self::Cancelled | Self::Decode(_) => false,
        }
    }
}

fn display_reason(reason: &Option<String>) -> String {
    reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default()
}
