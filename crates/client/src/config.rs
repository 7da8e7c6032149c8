//! Connection configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use seqwire_framing::{DEFAULT_SLACK, MAX_FRAME_SIZE};

/// Tunables for one connection.
///
/// Every field has a default, so a partial document deserializes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Deadline for each correlated request, counted from registration (default: 10s)
    pub request_timeout: Duration,
    /// Timeout for establishing a TCP connection (default: 5s)
    pub connect_timeout: Duration,
    /// Largest accepted or produced frame payload (default: 10 MiB)
    pub max_frame_size: usize,
    /// Size of the region each socket read is offered (default: 64 KiB)
    pub read_size_hint: usize,
    /// Extra bytes allocated whenever the read buffer grows (default: 1000)
    pub arena_slack: usize,
    /// Frames that may wait for the writer before senders block (default: 1024)
    pub write_queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            max_frame_size: MAX_FRAME_SIZE,
            read_size_hint: 64 * 1024,
            arena_slack: DEFAULT_SLACK,
            write_queue_capacity: 1024,
        }
    }
}
