//! Request/response multiplexing over one length-prefixed byte stream.
//!
//! Many callers share a single [`Connection`]. Each request carries a
//! sequence id chosen by the protocol engine; the reply carrying the same id
//! is routed back to the caller that is waiting for it. Frames nobody waits
//! for (server pushes, replies to requests that already timed out) go to an
//! [`EventHandler`].
//!
//! The engine that builds and decodes packet bodies is supplied by the
//! embedder through [`ProtocolEngine`] and [`RequestBuilder`].
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod handler;
pub mod multiplexer;
pub mod writer;

pub use client::{Client, ClientBuilder};
pub use config::ClientConfig;
pub use connection::{Connection, ConnectionState, Inbound};
pub use engine::{
    Command, DecodeError, Event, EventMetadata, OutboundRequest, ProtocolEngine, RequestBuilder,
    SequenceId,
};
pub use error::{Error, Result};
pub use handler::{EventHandler, NoopHandler, Notification};
pub use multiplexer::{Dispatch, Multiplexer, ResultSlot};
pub use writer::{Outbound, WriteRequest, WriterState};

// Re-export dependencies that are part of our public API
pub use bytes::Bytes;
pub use seqwire_framing::{FrameCodec, FramingError};
pub use tokio_util::sync::CancellationToken;
