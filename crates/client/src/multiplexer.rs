//! Correlation of outbound requests with inbound replies.
//!
//! A waiter must be registered *before* its request bytes are written, so a
//! reply that arrives right after the write always finds it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::engine::{Event, SequenceId};
use crate::error::{Error, Result};
use crate::handler::Notification;

/// What [`Multiplexer::dispatch`] did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A waiter received the event.
    Resolved,
    /// The waiter's receiver was gone before cleanup; the event was dropped.
    Stale,
    /// No waiter; the event went to the unsolicited path.
    Unsolicited,
}

/// Table entry for one outstanding request.
struct PendingRequest {
    /// Distinguishes this registration from later ones reusing the id.
    ticket: u64,
    sender: oneshot::Sender<Result<Event>>,
    deadline: Instant,
    cancel: CancellationToken,
}

struct Inner {
    pending: DashMap<SequenceId, PendingRequest>,
    next_ticket: AtomicU64,
    closed: AtomicBool,
    close_reason: Mutex<Option<String>>,
    fallback: mpsc::UnboundedSender<Notification>,
}

/// Table of outstanding requests keyed by sequence id.
///
/// Cloning is cheap; clones share the same table.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<Inner>,
}

impl Multiplexer {
    /// Create an empty table. Events without a waiter are sent to `fallback`.
    #[must_use]
    pub fn new(fallback: mpsc::UnboundedSender<Notification>) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: DashMap::new(),
                next_ticket: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                close_reason: Mutex::new(None),
                fallback,
            }),
        }
    }

    /// Register a waiter for `sequence_id`, expiring `timeout` from now.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateRequest`] if the id already has a live
    /// waiter (the existing waiter is left untouched), or
    /// [`Error::ConnectionClosed`] after [`Multiplexer::fail_all`].
    pub fn register_waiter(&self, sequence_id: SequenceId, timeout: Duration) -> Result<ResultSlot> {
        self.register_waiter_with_token(sequence_id, timeout, CancellationToken::new())
    }

    /// Like [`Multiplexer::register_waiter`], cancelled through `cancel`.
    ///
    /// # Errors
    ///
    /// See [`Multiplexer::register_waiter`].
    pub fn register_waiter_with_token(
        &self,
        sequence_id: SequenceId,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<ResultSlot> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + timeout;
        let (sender, receiver) = oneshot::channel();

        match self.inner.pending.entry(sequence_id) {
            Entry::Occupied(_) => {
                warn!(sequence_id, "sequence id already has a live waiter");
                return Err(Error::DuplicateRequest { sequence_id });
            }
            Entry::Vacant(entry) => {
                entry.insert(PendingRequest {
                    ticket,
                    sender,
                    deadline,
                    cancel: cancel.clone(),
                });
            }
        }

        // fail_all may have drained the table between the check above and
        // the insert; back out so the caller does not wait for nothing.
        if self.is_closed() {
            self.remove(sequence_id, ticket);
            return Err(self.closed_error());
        }

        trace!(sequence_id, pending = self.inner.pending.len(), "registered waiter");

        Ok(ResultSlot {
            multiplexer: self.clone(),
            sequence_id,
            ticket,
            receiver,
            deadline,
            timeout,
            cancel,
        })
    }

    /// Route a decoded event to its waiter, or to the unsolicited path.
    ///
    /// Resolving happens at most once per registration. A reply past its
    /// deadline, or for a cancelled request, is treated as unsolicited even
    /// if the waiter has not woken up yet.
    pub fn dispatch(&self, event: Event) -> Dispatch {
        let sequence_id = event.sequence_id;
        let now = Instant::now();

        let Some((_, pending)) = self
            .inner
            .pending
            .remove_if(&sequence_id, |_, pending| {
                pending.deadline > now && !pending.cancel.is_cancelled()
            })
        else {
            debug!(sequence_id, command = %event.command_name, "unsolicited event");
            if self.inner.fallback.send(Notification::Unsolicited(event)).is_err() {
                debug!(sequence_id, "no unsolicited receiver, event dropped");
            }
            return Dispatch::Unsolicited;
        };

        match pending.sender.send(Ok(event)) {
            Ok(()) => Dispatch::Resolved,
            Err(_) => {
                trace!(sequence_id, "waiter gone before reply");
                Dispatch::Stale
            }
        }
    }

    /// Fail every outstanding request with [`Error::ConnectionClosed`] and
    /// refuse new registrations. Returns how many requests were failed.
    pub fn fail_all(&self, reason: Option<&str>) -> usize {
        {
            let mut close_reason = self.inner.close_reason.lock();
            if close_reason.is_none() {
                *close_reason = reason.map(ToString::to_string);
            }
        }
        self.inner.closed.store(true, Ordering::SeqCst);

        let ids: Vec<SequenceId> = self.inner.pending.iter().map(|entry| *entry.key()).collect();

        let mut failed = 0;
        for sequence_id in ids {
            if let Some((_, pending)) = self.inner.pending.remove(&sequence_id) {
                let _ = pending.sender.send(Err(Error::closed(reason)));
                failed += 1;
            }
        }

        if failed > 0 {
            debug!(failed, "failed outstanding requests");
        }

        failed
    }

    /// Whether [`Multiplexer::fail_all`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Whether `sequence_id` has a live waiter.
    #[must_use]
    pub fn is_pending(&self, sequence_id: SequenceId) -> bool {
        self.inner.pending.contains_key(&sequence_id)
    }

    /// Remove the entry for `sequence_id` only if it is still `ticket`'s.
    fn remove(&self, sequence_id: SequenceId, ticket: u64) -> bool {
        self.inner
            .pending
            .remove_if(&sequence_id, |_, pending| pending.ticket == ticket)
            .is_some()
    }

    fn closed_error(&self) -> Error {
        Error::closed(self.inner.close_reason.lock().as_deref())
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Handle to one registered waiter.
///
/// Dropping an unresolved slot removes its table entry, so a reply that
/// arrives later is treated as unsolicited.
pub struct ResultSlot {
    multiplexer: Multiplexer,
    sequence_id: SequenceId,
    ticket: u64,
    receiver: oneshot::Receiver<Result<Event>>,
    deadline: Instant,
    timeout: Duration,
    cancel: CancellationToken,
}

enum Wake {
    Resolved(std::result::Result<Result<Event>, oneshot::error::RecvError>),
    Cancelled,
    Expired,
}

impl ResultSlot {
    /// Sequence id this slot waits for.
    #[must_use]
    pub const fn sequence_id(&self) -> SequenceId {
        self.sequence_id
    }

    /// Instant after which the request times out.
    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Token that cancels this request when triggered.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the reply.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] once the deadline passes;
    /// - [`Error::Cancelled`] if the cancellation token fires;
    /// - [`Error::ConnectionClosed`] if the connection goes away first.
    ///
    /// In the first two cases the table entry is removed before returning.
    pub async fn wait(mut self) -> Result<Event> {
        let wake = tokio::select! {
            biased;
            result = &mut self.receiver => Wake::Resolved(result),
            () = self.cancel.cancelled() => Wake::Cancelled,
            () = tokio::time::sleep_until(self.deadline) => Wake::Expired,
        };

        let failure = match wake {
            Wake::Resolved(Ok(result)) => return result,
            // Torn down after the token fired; the cancellation wins.
            Wake::Resolved(Err(_)) if self.cancel.is_cancelled() => return Err(Error::Cancelled),
            Wake::Resolved(Err(_)) => return Err(self.multiplexer.closed_error()),
            Wake::Cancelled => Error::Cancelled,
            Wake::Expired => Error::Timeout(self.timeout),
        };

        if self.multiplexer.remove(self.sequence_id, self.ticket) {
            debug!(sequence_id = self.sequence_id, error = %failure, "request abandoned");
            return Err(failure);
        }

        // The entry was taken by dispatch or fail_all in the meantime.
        match self.receiver.try_recv() {
            Ok(result) => result,
            Err(_) => Err(failure),
        }
    }
}

impl Drop for ResultSlot {
    fn drop(&mut self) {
        if self.multiplexer.remove(self.sequence_id, self.ticket) {
            trace!(sequence_id = self.sequence_id, "waiter dropped before resolution");
        }
    }
}

impl std::fmt::Debug for ResultSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSlot")
            .field("sequence_id", &self.sequence_id)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}
