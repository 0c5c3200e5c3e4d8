use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::events::{ConnectionEvent, ConnectionEventListener, ListenerId, ListenerSet};
use super::key::{BindingInfo, ConnectionKey};
use crate::error::{Error, Result};
use crate::transport::Transport;

/// Reply to a keepalive ping (RFC 5626 §3.5.1)
pub const KEEPALIVE_PONG: &[u8] = b"\r\n";

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// The byte sink behind a connection
#[async_trait]
pub(crate) trait Channel: Send + Sync {
    async fn write(&self, bytes: &[u8], target: SocketAddr) -> io::Result<()>;

    async fn shutdown(&self);
}

struct ConnState {
    references: usize,
    last_activity: Instant,
    closed: bool,
}

/// A live UDP, TCP or TLS connection held by the [`ConnectionRegistry`]
///
/// Sends are serialized under a send lock; a sender that cannot take it
/// within the lock wait buffer fails with [`Error::LockTimeout`]. Any send
/// failure closes the connection and notifies subscribers.
///
/// [`ConnectionRegistry`]: super::ConnectionRegistry
pub struct SipConnection {
    key: ConnectionKey,
    binding: BindingInfo,
    direction: Direction,
    timeout: Duration,
    lock_wait: Duration,
    state: Mutex<ConnState>,
    send_lock: tokio::sync::Mutex<()>,
    channel: Box<dyn Channel>,
    listeners: ListenerSet,
    shutdown: CancellationToken,
}

impl SipConnection {
    pub(crate) fn new(
        binding: BindingInfo,
        direction: Direction,
        timeout: Duration,
        lock_wait: Duration,
        channel: Box<dyn Channel>,
    ) -> Self {
        Self {
            key: ConnectionKey::from_binding(&binding),
            binding,
            direction,
            timeout,
            lock_wait,
            state: Mutex::new(ConnState {
                references: 0,
                last_activity: Instant::now(),
                closed: false,
            }),
            send_lock: tokio::sync::Mutex::new(()),
            channel,
            listeners: ListenerSet::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn binding(&self) -> &BindingInfo {
        &self.binding
    }

    pub fn transport(&self) -> Transport {
        self.binding.transport
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.binding.local
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.binding.remote
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Idle time after which an unreferenced connection is reaped
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn reference_count(&self) -> usize {
        self.state.lock().references
    }

    pub fn last_activity(&self) -> Instant {
        self.state.lock().last_activity
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Take a reference; returns false if the connection already closed
    pub fn add_reference(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.references += 1;
        true
    }

    /// Release a reference; the idle clock restarts when the count hits zero
    pub fn remove_reference(&self) {
        let mut state = self.state.lock();
        if state.references == 0 {
            warn!("Reference count underflow on {}", self.key);
            return;
        }
        state.references -= 1;
        if state.references == 0 {
            state.last_activity = Instant::now();
        }
    }

    /// Record activity now
    pub fn touch(&self) {
        self.state.lock().last_activity = Instant::now();
    }

    /// True iff unreferenced and idle for longer than the timeout
    pub fn should_close(&self, now: Instant) -> bool {
        let state = self.state.lock();
        !state.closed && Self::idle(&state, now, self.timeout)
    }

    fn idle(state: &ConnState, now: Instant, timeout: Duration) -> bool {
        state.references == 0 && now.saturating_duration_since(state.last_activity) > timeout
    }

    /// Mark closed if idle, in one step with respect to `add_reference`
    pub(crate) fn try_reap(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        if state.closed || !Self::idle(&state, now, self.timeout) {
            return false;
        }
        state.closed = true;
        true
    }

    /// Subscribe to this connection's close/error event
    pub fn subscribe(&self, listener: Arc<dyn ConnectionEventListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Cancelled once the connection closes; reader tasks stop on it
    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Send to the connected peer
    pub async fn send(self: &Arc<Self>, bytes: &[u8]) -> Result<()> {
        self.write(bytes, self.binding.remote).await
    }

    /// Send to `addr:port`; stream connections only accept their own peer
    pub async fn send_to(self: &Arc<Self>, bytes: &[u8], addr: IpAddr, port: u16) -> Result<()> {
        let target = SocketAddr::new(addr, port);
        if self.transport().is_reliable() && target != self.binding.remote {
            return Err(Error::DestinationMismatch {
                bound: self.binding.remote,
                requested: target,
            });
        }
        self.write(bytes, target).await
    }

    /// Answer a keepalive ping with a bare CRLF
    pub async fn send_keepalive_reply(self: &Arc<Self>) -> Result<()> {
        trace!("Sending keepalive pong to {}", self.binding.remote);
        self.send(KEEPALIVE_PONG).await
    }

    async fn write(self: &Arc<Self>, bytes: &[u8], target: SocketAddr) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed(self.binding.remote));
        }

        let guard = match tokio::time::timeout(self.lock_wait, self.send_lock.lock()).await {
            Ok(guard) => guard,
            Err(_) => {
                warn!("Send lock on {} not acquired within {:?}", self.key, self.lock_wait);
                self.terminate(ConnectionEvent::Error {
                    connection: self.clone(),
                    reason: "send lock timeout".to_string(),
                })
                .await;
                return Err(Error::LockTimeout {
                    remote: self.binding.remote,
                    waited: self.lock_wait,
                });
            }
        };

        // A close may have won the race for the lock
        if self.is_closed() {
            return Err(Error::ConnectionClosed(self.binding.remote));
        }

        trace!("Sending {} bytes to {} over {}", bytes.len(), target, self.transport());
        let outcome = self.channel.write(bytes, target).await;
        drop(guard);

        match outcome {
            Ok(()) => {
                self.touch();
                Ok(())
            }
            Err(e) => {
                self.fail(&e).await;
                Err(Error::Io(e))
            }
        }
    }

    /// Close and notify subscribers with `Closed`
    pub async fn close(self: &Arc<Self>) {
        self.terminate(ConnectionEvent::Closed { connection: self.clone() }).await;
    }

    /// Close after a socket error, notifying `Error` or `IcmpError`
    pub(crate) async fn fail(self: &Arc<Self>, error: &io::Error) {
        let reason = error.to_string();
        let event = if is_icmp_error(error) && !self.transport().is_reliable() {
            ConnectionEvent::IcmpError {
                connection: self.clone(),
                reason,
            }
        } else {
            ConnectionEvent::Error {
                connection: self.clone(),
                reason,
            }
        };
        self.terminate(event).await;
    }

    /// Close with an event raised outside the socket layer
    pub(crate) async fn terminate(self: &Arc<Self>, event: ConnectionEvent) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.finish_close(event).await;
    }

    /// Release the socket and notify; the caller already marked the connection closed
    pub(crate) async fn finish_close(self: &Arc<Self>, event: ConnectionEvent) {
        debug!("Closing {} ({})", self.key, event.kind());
        self.shutdown.cancel();

        match tokio::time::timeout(self.lock_wait, self.send_lock.lock()).await {
            Ok(_guard) => self.channel.shutdown().await,
            Err(_) => debug!("Send lock busy, leaving {} to drop its socket", self.key),
        }

        self.listeners.dispatch(&event);
    }
}

/// ICMP port unreachable surfaces on a datagram socket as `ConnectionRefused`
pub(crate) fn is_icmp_error(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::ConnectionRefused
}

impl fmt::Debug for SipConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SipConnection")
            .field("key", &self.key)
            .field("direction", &self.direction)
            .field("references", &state.references)
            .field("closed", &state.closed)
            .finish()
    }
}

/// A counted reference to a connection, released on drop
pub struct ConnectionLease {
    connection: Arc<SipConnection>,
}

impl ConnectionLease {
    /// Wrap `connection`, taking a reference; `None` if it already closed
    pub fn acquire(connection: Arc<SipConnection>) -> Option<Self> {
        connection.add_reference().then(|| Self { connection })
    }

    pub fn connection(&self) -> &Arc<SipConnection> {
        &self.connection
    }
}

impl std::ops::Deref for ConnectionLease {
    type Target = Arc<SipConnection>;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.connection.remove_reference();
    }
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionLease").field(&self.connection.key).finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Channel that records writes and fails on demand
    #[derive(Default)]
    pub(crate) struct RecordingChannel {
        pub(crate) writes: Arc<parking_lot::Mutex<Vec<(Vec<u8>, SocketAddr)>>>,
        pub(crate) fail_with: Option<io::ErrorKind>,
        pub(crate) shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Channel for RecordingChannel {
        async fn write(&self, bytes: &[u8], target: SocketAddr) -> io::Result<()> {
            if let Some(kind) = self.fail_with {
                return Err(io::Error::new(kind, "injected"));
            }
            self.writes.lock().push((bytes.to_vec(), target));
            Ok(())
        }

        async fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn connection_with(transport: Transport, channel: RecordingChannel, timeout: Duration) -> Arc<SipConnection> {
        let binding = BindingInfo::new(
            "10.0.0.1:5060".parse().unwrap(),
            "198.51.100.7:5060".parse().unwrap(),
            transport,
            "test",
        );
        Arc::new(SipConnection::new(
            binding,
            Direction::Outgoing,
            timeout,
            Duration::from_millis(50),
            Box::new(channel),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_close_boundary() {
        let conn = connection_with(Transport::Udp, RecordingChannel::default(), Duration::from_secs(60));
        let start = conn.last_activity();

        assert!(!conn.should_close(start + Duration::from_secs(60)));
        assert!(!conn.should_close(start + Duration::from_millis(59_999)));
        assert!(conn.should_close(start + Duration::from_millis(60_001)));

        assert!(conn.add_reference());
        assert!(!conn.should_close(start + Duration::from_secs(3600)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_reference_restarts_idle_clock() {
        let conn = connection_with(Transport::Tcp, RecordingChannel::default(), Duration::from_secs(10));
        let created = conn.last_activity();
        conn.add_reference();
        tokio::time::advance(Duration::from_secs(30)).await;
        conn.remove_reference();

        assert!(conn.last_activity() > created);
        assert!(!conn.should_close(Instant::now() + Duration::from_secs(9)));

        conn.remove_reference();
        assert_eq!(conn.reference_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_rejects_other_destination() {
        let conn = connection_with(Transport::Tcp, RecordingChannel::default(), Duration::from_secs(10));
        let err = conn
            .send_to(b"OPTIONS", "198.51.100.8".parse().unwrap(), 5060)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DestinationMismatch { .. }));
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_udp_send_to_overrides_destination() {
        let channel = RecordingChannel::default();
        let writes = channel.writes.clone();
        let conn = connection_with(Transport::Udp, channel, Duration::from_secs(10));
        conn.send_to(b"MESSAGE", "198.51.100.8".parse().unwrap(), 5070).await.unwrap();
        conn.send_keepalive_reply().await.unwrap();

        let writes = writes.lock();
        assert_eq!(writes[0].1, "198.51.100.8:5070".parse().unwrap());
        assert_eq!(writes[1].0, KEEPALIVE_PONG.to_vec());
        assert_eq!(writes[1].1, conn.remote_addr());
    }

    #[tokio::test]
    async fn test_refused_datagram_is_icmp_error() {
        let channel = RecordingChannel {
            fail_with: Some(io::ErrorKind::ConnectionRefused),
            ..Default::default()
        };
        let shutdowns = channel.shutdowns.clone();
        let conn = connection_with(Transport::Udp, channel, Duration::from_secs(10));
        let (listener, mut events) = super::super::events::ChannelListener::new();
        conn.subscribe(listener);

        assert!(matches!(conn.send(b"INVITE").await, Err(Error::Io(_))));
        let event = events.recv().await.unwrap();
        assert_eq!(event.kind(), "ICMP_ERROR");
        assert!(conn.is_closed());
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);

        // Later sends fail fast and no second event is raised
        assert!(matches!(conn.send(b"INVITE").await, Err(Error::ConnectionClosed(_))));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_lock_timeout_is_send_failure() {
        let conn = connection_with(Transport::Tcp, RecordingChannel::default(), Duration::from_secs(10));
        let held = conn.send_lock.lock().await;

        let err = conn.send(b"BYE").await.unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));
        assert!(conn.is_closed());
        drop(held);
    }

    #[tokio::test]
    async fn test_lease_releases_on_drop() {
        let conn = connection_with(Transport::Udp, RecordingChannel::default(), Duration::from_secs(10));
        {
            let lease = ConnectionLease::acquire(conn.clone()).unwrap();
            assert_eq!(lease.reference_count(), 1);
            let _second = ConnectionLease::acquire(conn.clone()).unwrap();
            assert_eq!(conn.reference_count(), 2);
        }
        assert_eq!(conn.reference_count(), 0);

        conn.close().await;
        assert!(ConnectionLease::acquire(conn.clone()).is_none());
    }
}
