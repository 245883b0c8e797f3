//! Response correlation for request/response traffic.
//!
//! Every outstanding request is a pending call keyed by its even id. A pending
//! call ends in exactly one of these ways:
//!
//! - a response with the same id arrives ([`Correlator::deliver`])
//! - its deadline passes (the timer task fails it with [`Error::Timeout`])
//! - a new registration reuses the id ([`Error::Superseded`])
//! - it is cancelled ([`Error::Cancelled`])
//! - the connection closes ([`Error::ConnectionClosed`])
//!
//! All of these remove the entry under one mutex, so whichever gets there
//! first wins and the others find nothing to do.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use protocol::Envelope;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::error::{CloseReason, Error, Result};

type Outcome = Result<Envelope>;

/// What happened to an envelope offered to the correlator.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// It completed a pending call.
    Consumed,
    /// No pending call has this id; the envelope is handed back.
    NotMine(Envelope),
}

struct PendingCall {
    /// Distinguishes this registration from a later one with the same id.
    generation: u64,
    tx: oneshot::Sender<Outcome>,
    timer: Option<AbortHandle>,
}

impl PendingCall {
    fn finish(self, outcome: Outcome) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The caller may have dropped its future; nothing to tell then.
        let _ = self.tx.send(outcome);
    }
}

#[derive(Default)]
struct Inner {
    pending: HashMap<i32, PendingCall>,
    next_generation: u64,
    closed: Option<CloseReason>,
}

/// Matches responses to pending calls for one connection.
pub struct Correlator {
    inner: Mutex<Inner>,
    runtime: Handle,
}

impl Correlator {
    /// Create a correlator whose timers run on `runtime`.
    pub fn new(runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            runtime,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install a pending call for `id`.
    ///
    /// A `timeout` of `None` or zero waits indefinitely. An existing call with
    /// the same id is failed with [`Error::Superseded`] first.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionClosed`] once [`close`](Self::close) has run.
    pub fn register(
        self: &Arc<Self>,
        id: i32,
        timeout: Option<Duration>,
    ) -> Result<ResponseFuture> {
        let (tx, rx) = oneshot::channel();
        let timeout = timeout.filter(|t| !t.is_zero());

        let superseded = {
            let mut inner = self.lock();
            if let Some(reason) = &inner.closed {
                return Err(Error::ConnectionClosed(reason.clone()));
            }

            let generation = inner.next_generation;
            inner.next_generation += 1;

            let timer = timeout.map(|after| self.arm_timer(id, generation, after));
            inner.pending.insert(
                id,
                PendingCall {
                    generation,
                    tx,
                    timer,
                },
            )
        };

        if let Some(previous) = superseded {
            debug!(id, "Pending request superseded");
            previous.finish(Err(Error::Superseded { id }));
        }

        Ok(ResponseFuture { id, rx })
    }

    fn arm_timer(self: &Arc<Self>, id: i32, generation: u64, after: Duration) -> AbortHandle {
        let correlator: Weak<Self> = Arc::downgrade(self);
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(correlator) = correlator.upgrade() {
                correlator.expire(id, generation, after);
            }
        });
        task.abort_handle()
    }

    fn expire(&self, id: i32, generation: u64, after: Duration) {
        let expired = {
            let mut inner = self.lock();
            match inner.pending.get(&id) {
                Some(call) if call.generation == generation => inner.pending.remove(&id),
                _ => None,
            }
        };

        if let Some(mut call) = expired {
            debug!(id, ?after, "Request timed out");
            // This task is the timer; aborting itself is pointless.
            call.timer = None;
            call.finish(Err(Error::Timeout { id, after }));
        }
    }

    /// Offer an inbound envelope.
    ///
    /// Completes and removes the pending call with the envelope's id, if any.
    pub fn deliver(&self, envelope: Envelope) -> Delivery {
        let id = envelope.id;
        let call = self.lock().pending.remove(&id);

        match call {
            Some(call) => {
                trace!(id, "Response matched pending request");
                call.finish(Ok(envelope));
                Delivery::Consumed
            }
            None => Delivery::NotMine(envelope),
        }
    }

    /// Fail a pending call with [`Error::Cancelled`].
    ///
    /// Returns false if no call with that id was pending.
    pub fn cancel(&self, id: i32) -> bool {
        self.fail(id, Error::Cancelled { id })
    }

    /// Fail a pending call with `error`.
    pub fn fail(&self, id: i32, error: Error) -> bool {
        let call = self.lock().pending.remove(&id);
        match call {
            Some(call) => {
                call.finish(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fail every pending call with [`Error::ConnectionClosed`] and refuse
    /// later registrations.
    pub fn close(&self, reason: CloseReason) {
        let drained: Vec<(i32, PendingCall)> = {
            let mut inner = self.lock();
            if inner.closed.is_none() {
                inner.closed = Some(reason.clone());
            }
            inner.pending.drain().collect()
        };

        if !drained.is_empty() {
            debug!(count = drained.len(), %reason, "Failing pending requests");
        }
        for (_, call) in drained {
            call.finish(Err(Error::ConnectionClosed(reason.clone())));
        }
    }

    /// Number of calls still waiting.
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Whether `id` has a pending call.
    pub fn is_pending(&self, id: i32) -> bool {
        self.lock().pending.contains_key(&id)
    }
}

/// Resolves to the response for one request.
///
/// Dropping the future does not cancel the pending call; the response, if it
/// arrives, is discarded. Use [`Connection::cancel`](crate::Connection::cancel)
/// to release it early.
#[derive(Debug)]
pub struct ResponseFuture {
    id: i32,
    rx: oneshot::Receiver<Outcome>,
}

impl ResponseFuture {
    /// A future that resolves immediately to `error`.
    pub(crate) fn failed(id: i32, error: Error) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self { id, rx }
    }

    /// The request id this future waits on.
    pub fn id(&self) -> i32 {
        self.id
    }
}

impl Future for ResponseFuture {
    type Output = Result<Envelope>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // The correlator was dropped without closing: the connection is gone.
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::ConnectionClosed(
                CloseReason::LocalDisconnect,
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}
