//! CVID to connection registry.
//!
//! The hub keeps one entry per established instance and routes envelopes
//! between them by recipient CVID. Entries disappear on their own when the
//! connection closes. Observers follow membership through
//! [`Registry::subscribe`].

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use net::{Connection, Error as NetError};
use protocol::{cvid, Cvid, Envelope, InstanceType};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Capacity of the event channel. Slow observers see `Lagged`.
const EVENT_CAPACITY: usize = 256;

/// Registry membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// An instance came online.
    Registered {
        cvid: Cvid,
        instance: Option<InstanceType>,
    },
    /// An instance went offline.
    Unregistered { cvid: Cvid },
}

/// Result of routing one envelope.
#[derive(Debug)]
pub enum RouteOutcome {
    /// Queued on the recipient's connection.
    Delivered,
    /// No instance with that CVID is registered.
    NoRoute,
    /// The recipient's connection refused the envelope (it is closing).
    Failed(NetError),
}

/// Connections of every registered instance, keyed by CVID.
pub struct Registry {
    connections: DashMap<Cvid, Connection>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            connections: DashMap::new(),
            events,
        })
    }

    /// Register `connection` under `cvid`, returning any connection it
    /// replaced.
    ///
    /// The entry is removed when the connection closes, unless by then it
    /// was already replaced by another connection.
    pub fn register(self: &Arc<Self>, cvid: Cvid, connection: Connection) -> Option<Connection> {
        let previous = self.connections.insert(cvid, connection.clone());
        info!(
            cvid,
            conn = connection.id(),
            replaced = previous.is_some(),
            "Instance registered"
        );
        self.emit(RegistryEvent::Registered {
            cvid,
            instance: cvid::extract_instance(cvid).ok(),
        });

        let registry: Weak<Self> = Arc::downgrade(self);
        let conn_id = connection.id();
        connection.on_closed(move |reason| {
            if let Some(registry) = registry.upgrade() {
                if registry.unregister_if(cvid, conn_id) {
                    debug!(cvid, %reason, "Unregistered closed connection");
                }
            }
        });

        previous
    }

    /// The connection registered under `cvid`.
    pub fn lookup(&self, cvid: Cvid) -> Option<Connection> {
        self.connections.get(&cvid).map(|entry| entry.value().clone())
    }

    /// Remove the entry for `cvid`.
    pub fn unregister(&self, cvid: Cvid) -> Option<Connection> {
        let removed = self.connections.remove(&cvid).map(|(_, connection)| connection);
        if removed.is_some() {
            self.emit_unregistered(cvid);
        }
        removed
    }

    /// Remove the entry for `cvid` only if it still belongs to connection
    /// `conn_id`.
    fn unregister_if(&self, cvid: Cvid, conn_id: u64) -> bool {
        let removed = self
            .connections
            .remove_if(&cvid, |_, connection| connection.id() == conn_id)
            .is_some();
        if removed {
            self.emit_unregistered(cvid);
        }
        removed
    }

    /// Hand `envelope` to the connection registered under its recipient.
    pub fn route(&self, envelope: Envelope) -> RouteOutcome {
        let Some(connection) = self.lookup(envelope.to) else {
            return RouteOutcome::NoRoute;
        };
        match connection.send_envelope(envelope) {
            Ok(()) => RouteOutcome::Delivered,
            Err(e) => RouteOutcome::Failed(e),
        }
    }

    /// Whether `cvid` is registered.
    pub fn contains(&self, cvid: Cvid) -> bool {
        self.connections.contains_key(&cvid)
    }

    /// Registered CVIDs.
    pub fn cvids(&self) -> Vec<Cvid> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Watch membership changes.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Disconnect every registered connection.
    pub fn disconnect_all(&self) {
        let connections: Vec<Connection> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for connection in connections {
            connection.disconnect();
        }
    }

    fn emit_unregistered(&self, cvid: Cvid) {
        info!(cvid, "Instance unregistered");
        self.emit(RegistryEvent::Unregistered { cvid });
    }

    fn emit(&self, event: RegistryEvent) {
        let _ = self.events.send(event);
    }
}
