//! Connection lifecycle events
//!
//! A connection that closes, for whatever reason, emits exactly one
//! [`ConnectionEvent`] to every subscriber registered at that moment.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::trace;

use super::connection::SipConnection;

/// Why a connection went away
#[derive(Clone)]
pub enum ConnectionEvent {
    /// Closed explicitly or reaped as idle
    Closed { connection: Arc<SipConnection> },
    /// A socket error closed the connection
    Error {
        connection: Arc<SipConnection>,
        reason: String,
    },
    /// The peer's host or port was reported unreachable
    IcmpError {
        connection: Arc<SipConnection>,
        reason: String,
    },
}

impl ConnectionEvent {
    /// The connection the event is about
    pub fn connection(&self) -> &Arc<SipConnection> {
        match self {
            ConnectionEvent::Closed { connection }
            | ConnectionEvent::Error { connection, .. }
            | ConnectionEvent::IcmpError { connection, .. } => connection,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ConnectionEvent::Closed { .. } => "CLOSED",
            ConnectionEvent::Error { .. } => "ERROR",
            ConnectionEvent::IcmpError { .. } => "ICMP_ERROR",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ConnectionEvent::Closed { .. } => None,
            ConnectionEvent::Error { reason, .. } | ConnectionEvent::IcmpError { reason, .. } => Some(reason),
        }
    }
}

impl fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEvent")
            .field("kind", &self.kind())
            .field("key", self.connection().key())
            .field("reason", &self.reason())
            .finish()
    }
}

/// Subscriber to connection events
///
/// Callbacks run on the task that closed the connection and must not block.
pub trait ConnectionEventListener: Send + Sync {
    fn on_closed(&self, _event: &ConnectionEvent) {}

    fn on_error(&self, _event: &ConnectionEvent) {}

    fn on_icmp_error(&self, _event: &ConnectionEvent) {}
}

/// Forwards every event into an unbounded channel
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ChannelListener {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn forward(&self, event: &ConnectionEvent) {
        if self.tx.send(event.clone()).is_err() {
            trace!("Event receiver dropped, discarding {}", event.kind());
        }
    }
}

impl ConnectionEventListener for ChannelListener {
    fn on_closed(&self, event: &ConnectionEvent) {
        self.forward(event);
    }

    fn on_error(&self, event: &ConnectionEvent) {
        self.forward(event);
    }

    fn on_icmp_error(&self, event: &ConnectionEvent) {
        self.forward(event);
    }
}

/// Handle returned by a subscription, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Subscriber list that can change while an event is being dispatched
#[derive(Default)]
pub(crate) struct ListenerSet {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn ConnectionEventListener>)>>,
}

impl ListenerSet {
    pub(crate) fn add(&self, listener: Arc<dyn ConnectionEventListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Deliver `event` to a snapshot of the current subscribers
    pub(crate) fn dispatch(&self, event: &ConnectionEvent) {
        let snapshot: Vec<Arc<dyn ConnectionEventListener>> =
            self.listeners.read().iter().map(|(_, l)| l.clone()).collect();
        for listener in snapshot {
            match event {
                ConnectionEvent::Closed { .. } => listener.on_closed(event),
                ConnectionEvent::Error { .. } => listener.on_error(event),
                ConnectionEvent::IcmpError { .. } => listener.on_icmp_error(event),
            }
        }
    }
}
