//! Delivery of events nobody is waiting for.

use std::sync::Arc;

use async_trait::async_trait;
use seqwire_framing::FramingError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::engine::{DecodeError, Event};

/// Something the connection reports outside of any request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A frame whose sequence id had no live waiter, such as a server push
    /// or a reply that arrived after its request timed out.
    Unsolicited(Event),
    /// The engine failed to decode a frame. Later frames are unaffected.
    DecodeFailed(DecodeError),
    /// The inbound stream was corrupt and the connection is going down.
    ProtocolError(FramingError),
}

/// Receives connection notifications, in arrival order.
///
/// All methods default to doing nothing.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Called for a frame that matched no outstanding request.
    async fn on_unsolicited(&self, _event: Event) {}

    /// Called when the engine could not decode a frame.
    async fn on_decode_error(&self, _error: DecodeError) {}

    /// Called when the inbound stream was found to be corrupt.
    async fn on_protocol_error(&self, _error: FramingError) {}
}

/// Handler that ignores every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

#[async_trait]
impl EventHandler for NoopHandler {}

/// Forward notifications to `handler` one at a time until shutdown.
///
/// Anything already queued when shutdown fires is still delivered.
pub(crate) async fn pump(
    handler: Arc<dyn EventHandler>,
    mut notifications: mpsc::UnboundedReceiver<Notification>,
    shutdown: CancellationToken,
) {
    loop {
        let notification = tokio::select! {
            biased;
            notification = notifications.recv() => match notification {
                Some(notification) => notification,
                None => break,
            },
            () = shutdown.cancelled() => break,
        };

        trace!(?notification, "delivering notification");
        match notification {
            Notification::Unsolicited(event) => handler.on_unsolicited(event).await,
            Notification::DecodeFailed(error) => handler.on_decode_error(error).await,
            Notification::ProtocolError(error) => handler.on_protocol_error(error).await,
        }
    }

    debug!("notification pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn on_unsolicited(&self, event: Event) {
            self.seen.lock().push(format!("event {}", event.sequence_id));
        }

        async fn on_decode_error(&self, error: DecodeError) {
            self.seen.lock().push(error.to_string());
        }
    }

    #[tokio::test]
    async fn test_pump_delivers_in_order_then_drains_on_shutdown() {
        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        tx.send(Notification::Unsolicited(Event::new(1, "a", Bytes::new())))
            .unwrap();
        tx.send(Notification::DecodeFailed(DecodeError::Malformed("x".into())))
            .unwrap();
        tx.send(Notification::Unsolicited(Event::new(2, "b", Bytes::new())))
            .unwrap();
        shutdown.cancel();

        pump(recorder.clone(), rx, shutdown).await;

        assert_eq!(
            *recorder.seen.lock(),
            vec!["event 1", "Malformed packet: x", "event 2"]
        );
    }

    #[tokio::test]
    async fn test_noop_handler_accepts_everything() {
        let handler = NoopHandler;
        handler
            .on_protocol_error(FramingError::EmptyInput)
            .await;
        handler
            .on_unsolicited(Event::new(0, "x", Bytes::new()))
            .await;
    }
}
