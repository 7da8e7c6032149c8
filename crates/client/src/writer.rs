//! Writability gate and the single-writer outbound queue.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Shared flag saying whether the transport currently accepts writes.
///
/// Starts writable. Cloning is cheap; clones share the same flag.
#[derive(Debug, Clone)]
pub struct WriterState {
    tx: Arc<watch::Sender<bool>>,
}

impl WriterState {
    /// Create a writable state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(true);
        Self { tx: Arc::new(tx) }
    }

    /// Flip the flag. Returns whether it changed.
    pub fn set_writable(&self, writable: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == writable {
                false
            } else {
                *current = writable;
                true
            }
        });
        if changed {
            trace!(writable, "writer state changed");
        }
        changed
    }

    /// Whether writes may proceed right now.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the transport is writable. Returns immediately if it is.
    pub async fn wait_writable(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|writable| *writable).await;
    }
}

impl Default for WriterState {
    fn default() -> Self {
        Self::new()
    }
}

/// One encoded frame waiting for the writer.
#[derive(Debug)]
pub struct WriteRequest {
    frame: Bytes,
    done: oneshot::Sender<io::Result<()>>,
}

impl WriteRequest {
    pub(crate) const fn new(frame: Bytes, done: oneshot::Sender<io::Result<()>>) -> Self {
        Self { frame, done }
    }

    /// The complete frame, length prefix included.
    #[must_use]
    pub const fn frame(&self) -> &Bytes {
        &self.frame
    }

    /// Report the outcome to the sender. A sender that stopped waiting is
    /// not an error.
    pub fn complete(self, result: io::Result<()>) {
        let _ = self.done.send(result);
    }
}

/// Receiving end of the outbound queue. Exactly one exists per connection,
/// which makes it the only path to the transport.
#[derive(Debug)]
pub struct Outbound {
    rx: mpsc::Receiver<WriteRequest>,
}

impl Outbound {
    pub(crate) const fn new(rx: mpsc::Receiver<WriteRequest>) -> Self {
        Self { rx }
    }

    /// Next frame to write, or `None` once every sender is gone.
    pub async fn next(&mut self) -> Option<WriteRequest> {
        self.rx.recv().await
    }

    /// Next frame if one is queued right now.
    pub fn try_next(&mut self) -> Option<WriteRequest> {
        self.rx.try_recv().ok()
    }
}

/// Drain `outbound` into `writer` until shutdown or a write failure.
///
/// Each frame goes out with one `write_all` and a flush. A failure is
/// returned to the caller and ends the loop; nothing is retried.
pub(crate) async fn write_loop<W>(
    mut writer: W,
    mut outbound: Outbound,
    state: WriterState,
    shutdown: CancellationToken,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let result = loop {
        let request = tokio::select! {
            () = shutdown.cancelled() => break Ok(()),
            request = outbound.next() => match request {
                Some(request) => request,
                None => break Ok(()),
            },
        };

        tokio::select! {
            () = shutdown.cancelled() => {
                request.complete(Err(io::ErrorKind::ConnectionAborted.into()));
                break Ok(());
            }
            () = state.wait_writable() => {}
        }

        let written = tokio::select! {
            () = shutdown.cancelled() => Err(io::ErrorKind::ConnectionAborted.into()),
            written = write_frame(&mut writer, request.frame()) => written,
        };

        match written {
            Ok(()) => {
                trace!(len = request.frame().len(), "frame written");
                request.complete(Ok(()));
            }
            Err(e) => {
                warn!(error = %e, "write failed");
                request.complete(Err(io::Error::new(e.kind(), e.to_string())));
                break Err(e);
            }
        }
    };

    if let Err(e) = writer.shutdown().await {
        debug!(error = %e, "error shutting down writer");
    }
    debug!("writer stopped");
    result
}

async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}
