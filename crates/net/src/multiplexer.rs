//! Stream multiplexing over one connection.
//!
//! A stream is a long-lived logical channel named by an odd envelope id.
//! Every envelope carrying a live stream's id is handed to that stream's
//! consumer in the order the frames arrived. Envelopes for ids with no live
//! stream are dropped. A consumer never sees a message after its closure
//! notice, even when the stream is closed from another thread mid-delivery.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use protocol::{ids, Envelope};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{CloseReason, Error, Result};

/// Receives the envelopes of one stream.
///
/// Both methods are called from the connection's reader. They must return
/// quickly: a consumer that blocks stalls every other stream and response on
/// the connection.
pub trait StreamConsumer: Send + Sync {
    /// A message arrived on the stream.
    fn on_message(&self, envelope: Envelope);

    /// The stream ended. Called exactly once.
    fn on_closed(&self, reason: StreamClosed);
}

/// Why a stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamClosed {
    /// `close_stream` was called for the id.
    Closed,
    /// The whole connection went away.
    ConnectionClosed(CloseReason),
}

/// Event delivered to a channel-backed stream consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Message(Envelope),
    Closed(StreamClosed),
}

/// Receiving half of a channel-backed stream.
pub type StreamReceiver = mpsc::UnboundedReceiver<StreamEvent>;

/// Consumer that forwards into an unbounded channel.
///
/// Never blocks the reader and never drops or reorders events.
pub struct ChannelConsumer {
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl ChannelConsumer {
    /// Create a consumer and the receiver it feeds.
    pub fn new() -> (Self, StreamReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StreamConsumer for ChannelConsumer {
    fn on_message(&self, envelope: Envelope) {
        let _ = self.tx.send(StreamEvent::Message(envelope));
    }

    fn on_closed(&self, reason: StreamClosed) {
        let _ = self.tx.send(StreamEvent::Closed(reason));
    }
}

/// What happened to an envelope offered to the multiplexer.
#[derive(Debug, Clone, PartialEq)]
pub enum Routing {
    /// Handed to a live stream.
    Consumed,
    /// Odd id with no live stream; discarded.
    Dropped,
    /// Not a stream id; the envelope is handed back.
    NotMine(Envelope),
}

/// A live stream's consumer plus the bookkeeping that keeps its closure
/// notice after every message it was handed.
struct Slot {
    consumer: Arc<dyn StreamConsumer>,
    state: Mutex<SlotState>,
}

#[derive(Default)]
struct SlotState {
    closed: bool,
    delivering: bool,
    /// Closure requested while a message was being delivered.
    deferred: Option<StreamClosed>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Slot {
    fn new(consumer: Arc<dyn StreamConsumer>) -> Arc<Self> {
        Arc::new(Self {
            consumer,
            state: Mutex::new(SlotState::default()),
        })
    }

    /// Returns false if the stream closed before delivery started.
    fn deliver(&self, envelope: Envelope) -> bool {
        {
            let mut state = lock(&self.state);
            if state.closed {
                return false;
            }
            state.delivering = true;
        }

        self.consumer.on_message(envelope);

        let deferred = {
            let mut state = lock(&self.state);
            state.delivering = false;
            state.deferred.take()
        };
        if let Some(reason) = deferred {
            self.consumer.on_closed(reason);
        }
        true
    }

    /// Notify the consumer once. A close that races a delivery (from another
    /// thread, or from inside `on_message`) is handed over by the deliverer.
    fn close(&self, reason: StreamClosed) {
        {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            state.closed = true;
            if state.delivering {
                state.deferred = Some(reason);
                return;
            }
        }
        self.consumer.on_closed(reason);
    }
}

#[derive(Default)]
struct Inner {
    streams: HashMap<i32, Arc<Slot>>,
    closed: Option<CloseReason>,
}

/// Stream table for one connection.
#[derive(Default)]
pub struct Multiplexer {
    inner: Mutex<Inner>,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }

    /// Register `consumer` for stream `id`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidStreamId`] if `id` is not odd.
    /// - [`Error::StreamExists`] if the id is already live.
    /// - [`Error::ConnectionClosed`] after [`close_all`](Self::close_all).
    pub fn open(&self, id: i32, consumer: Arc<dyn StreamConsumer>) -> Result<()> {
        if !ids::is_stream_id(id) {
            return Err(Error::InvalidStreamId(id));
        }

        let mut inner = self.lock();
        if let Some(reason) = &inner.closed {
            return Err(Error::ConnectionClosed(reason.clone()));
        }
        if inner.streams.contains_key(&id) {
            return Err(Error::StreamExists(id));
        }
        inner.streams.insert(id, Slot::new(consumer));
        debug!(id, "Stream opened");
        Ok(())
    }

    /// Remove stream `id` and notify its consumer.
    ///
    /// Returns false if the stream was not live.
    pub fn close(&self, id: i32) -> bool {
        let slot = self.lock().streams.remove(&id);
        match slot {
            Some(slot) => {
                debug!(id, "Stream closed");
                slot.close(StreamClosed::Closed);
                true
            }
            None => false,
        }
    }

    /// Offer an inbound envelope.
    pub fn route(&self, envelope: Envelope) -> Routing {
        let id = envelope.id;
        if !ids::is_stream_id(id) {
            return Routing::NotMine(envelope);
        }

        // Clone out so the consumer runs without the table locked; it may
        // close its own stream from inside the callback.
        let slot = self.lock().streams.get(&id).cloned();
        match slot {
            Some(slot) if slot.deliver(envelope) => Routing::Consumed,
            Some(_) => {
                debug!(id, "Dropping envelope for stream closed mid-route");
                Routing::Dropped
            }
            None => {
                debug!(id, "Dropping envelope for unknown stream");
                Routing::Dropped
            }
        }
    }

    /// Remove every stream, notifying each consumer once, and refuse later
    /// opens.
    pub fn close_all(&self, reason: CloseReason) {
        let drained: Vec<(i32, Arc<Slot>)> = {
            let mut inner = self.lock();
            if inner.closed.is_none() {
                inner.closed = Some(reason.clone());
            }
            inner.streams.drain().collect()
        };
        for (id, slot) in drained {
            debug!(id, "Stream closed with connection");
            slot.close(StreamClosed::ConnectionClosed(reason.clone()));
        }
    }

    /// Whether stream `id` is live.
    pub fn contains(&self, id: i32) -> bool {
        self.lock().streams.contains_key(&id)
    }

    /// Number of live streams.
    pub fn len(&self) -> usize {
        self.lock().streams.len()
    }

    /// Whether no streams are live.
    pub fn is_empty(&self) -> bool {
        self.lock().streams.is_empty()
    }
}
