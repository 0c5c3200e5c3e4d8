//! The connection registry
//!
//! Maps a [`ConnectionKey`] to at most one live [`SipConnection`]. Each key
//! owns a `OnceCell`, so concurrent callers for one key share a single
//! creation while callers for other keys never wait on it. Every registered
//! connection carries a hook that removes its entry when it closes and
//! forwards the event to registry-level subscribers.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::connection::{ConnectionLease, Direction, SipConnection};
use super::events::{ConnectionEvent, ConnectionEventListener, ListenerId, ListenerSet};
use super::key::{unspecified_like, BindingInfo, ConnectionKey};
use super::stream::{connect_tcp, spawn_stream_reader, StreamChannel};
#[cfg(feature = "tls")]
use super::tls::TlsContext;
use super::tuning::{NoopTuner, SocketTuner};
use super::udp::{spawn_datagram_reader, DatagramChannel};
use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::ingest::InboundHandler;
use crate::locator::Hop;
use crate::transport::Transport;

/// Attempts at acquiring a key whose connection keeps closing underneath us
const MAX_ACQUIRE_ATTEMPTS: usize = 3;

type Slot = Arc<OnceCell<Arc<SipConnection>>>;

/// Live connection counts per transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub udp: usize,
    pub tcp: usize,
    pub tls: usize,
}

impl RegistryStats {
    pub fn total(&self) -> usize {
        self.udp + self.tcp + self.tls
    }

    pub fn streams(&self) -> usize {
        self.tcp + self.tls
    }
}

/// Stands in until the ingestion pipeline is attached; never upgraded
struct Unattached;

#[async_trait]
impl InboundHandler for Unattached {
    async fn on_inbound(&self, _bytes: Bytes, _binding: BindingInfo, _connection: Option<Arc<SipConnection>>) {}
}

/// One reserved stream connection, given back on drop
struct StreamPermit {
    open: Arc<AtomicUsize>,
}

impl Drop for StreamPermit {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::AcqRel);
    }
}

struct RegistryInner {
    config: TransportConfig,
    connections: DashMap<ConnectionKey, Slot>,
    open_streams: Arc<AtomicUsize>,
    udp_sockets: DashMap<SocketAddr, Arc<UdpSocket>>,
    listeners: ListenerSet,
    inbound: RwLock<Weak<dyn InboundHandler>>,
    tuner: Arc<dyn SocketTuner>,
    #[cfg(feature = "tls")]
    tls: Option<Arc<TlsContext>>,
}

impl RegistryInner {
    /// Drop the entry for `key` if it still holds `connection`
    fn deregister(&self, key: &ConnectionKey, connection: &Arc<SipConnection>) -> bool {
        self.connections
            .remove_if(key, |_, slot| {
                slot.get().map_or(false, |existing| Arc::ptr_eq(existing, connection))
            })
            .is_some()
    }
}

/// Removes a connection's entry when it closes and fans the event out
///
/// A stream connection's capacity permit is released here as well.
struct RegistryHook {
    registry: Weak<RegistryInner>,
    key: ConnectionKey,
    permit: Mutex<Option<StreamPermit>>,
}

impl RegistryHook {
    fn handle(&self, event: &ConnectionEvent) {
        self.permit.lock().take();
        let Some(inner) = self.registry.upgrade() else {
            return;
        };
        if inner.deregister(&self.key, event.connection()) {
            trace!("Deregistered {} after {}", self.key, event.kind());
        }
        inner.listeners.dispatch(event);
    }
}

impl ConnectionEventListener for RegistryHook {
    fn on_closed(&self, event: &ConnectionEvent) {
        self.handle(event);
    }

    fn on_error(&self, event: &ConnectionEvent) {
        self.handle(event);
    }

    fn on_icmp_error(&self, event: &ConnectionEvent) {
        self.handle(event);
    }
}

/// Builder for [`ConnectionRegistry`]
pub struct RegistryBuilder {
    config: TransportConfig,
    tuner: Arc<dyn SocketTuner>,
    #[cfg(feature = "tls")]
    tls: Option<Arc<TlsContext>>,
}

impl RegistryBuilder {
    pub fn tuner(mut self, tuner: Arc<dyn SocketTuner>) -> Self {
        self.tuner = tuner;
        self
    }

    #[cfg(feature = "tls")]
    pub fn tls(mut self, tls: Arc<TlsContext>) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn build(self) -> ConnectionRegistry {
        let inbound: Weak<dyn InboundHandler> = Weak::<Unattached>::new();
        ConnectionRegistry {
            inner: Arc::new(RegistryInner {
                config: self.config,
                connections: DashMap::new(),
                open_streams: Arc::new(AtomicUsize::new(0)),
                udp_sockets: DashMap::new(),
                listeners: ListenerSet::default(),
                inbound: RwLock::new(inbound),
                tuner: self.tuner,
                #[cfg(feature = "tls")]
                tls: self.tls,
            }),
        }
    }
}

/// Shared table of live connections
///
/// Cloning is cheap; every clone sees the same table.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    /// A registry with untuned sockets and no TLS
    pub fn new(config: TransportConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: TransportConfig) -> RegistryBuilder {
        RegistryBuilder {
            config,
            tuner: Arc::new(NoopTuner),
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Where readers deliver inbound bytes
    ///
    /// Only a weak reference is kept; the caller owns the handler.
    pub fn set_inbound(&self, handler: &Arc<dyn InboundHandler>) {
        *self.inner.inbound.write() = Arc::downgrade(handler);
    }

    fn inbound(&self) -> Weak<dyn InboundHandler> {
        self.inner.inbound.read().clone()
    }

    /// Look up, and optionally create, the connection for a 4-tuple
    ///
    /// The returned lease holds a reference until dropped. `None` means no
    /// connection exists and `create_if_absent` was false.
    pub async fn get_connection(
        &self,
        network: &str,
        local_addr: Option<IpAddr>,
        local_port: Option<u16>,
        remote_addr: IpAddr,
        remote_port: u16,
        transport: Transport,
        create_if_absent: bool,
    ) -> Result<Option<ConnectionLease>> {
        let key = ConnectionKey::new(
            local_addr,
            local_port,
            SocketAddr::new(remote_addr, remote_port),
            transport,
        );
        self.acquire(network, key, None, create_if_absent).await
    }

    /// Connection for a resolved hop; the hop's hostname names the TLS server
    pub async fn get_connection_for_hop(
        &self,
        network: &str,
        hop: &Hop,
        create_if_absent: bool,
    ) -> Result<Option<ConnectionLease>> {
        let key = ConnectionKey::new(None, None, hop.socket_addr(), hop.transport);
        self.acquire(network, key, hop.hostname.as_deref(), create_if_absent)
            .await
    }

    async fn acquire(
        &self,
        network: &str,
        key: ConnectionKey,
        server_name: Option<&str>,
        create_if_absent: bool,
    ) -> Result<Option<ConnectionLease>> {
        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            if let Some((map_key, connection)) = self.find(&key) {
                if let Some(lease) = ConnectionLease::acquire(connection.clone()) {
                    return Ok(Some(lease));
                }
                // Closed but its hook has not run yet
                self.inner.deregister(&map_key, &connection);
                continue;
            }

            if !create_if_absent {
                return Ok(None);
            }

            let slot = self
                .inner
                .connections
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone();

            let created = slot
                .get_or_try_init(|| self.create(network, &key, server_name))
                .await;
            match created {
                Ok(connection) => {
                    if let Some(lease) = ConnectionLease::acquire(connection.clone()) {
                        return Ok(Some(lease));
                    }
                    // Closed before the slot was filled, so its hook found nothing to remove
                    self.inner.deregister(&key, connection);
                }
                Err(e) => {
                    self.inner
                        .connections
                        .remove_if(&key, |_, existing| Arc::ptr_eq(existing, &slot));
                    return Err(e);
                }
            }
        }
        Err(Error::ConnectionClosed(key.remote))
    }

    /// Exact key first, then any entry a wildcard on either side matches
    fn find(&self, key: &ConnectionKey) -> Option<(ConnectionKey, Arc<SipConnection>)> {
        if let Some(slot) = self.inner.connections.get(key) {
            if let Some(connection) = slot.get() {
                return Some((key.clone(), connection.clone()));
            }
        }
        self.inner.connections.iter().find_map(|entry| {
            let connection = entry.value().get()?;
            let hit = entry.key().matches(key) || connection.key().matches(key);
            (hit && !connection.is_closed()).then(|| (entry.key().clone(), connection.clone()))
        })
    }

    async fn create(&self, network: &str, key: &ConnectionKey, server_name: Option<&str>) -> Result<Arc<SipConnection>> {
        let connection = match key.transport {
            Transport::Udp => self.create_datagram(network, key).await?,
            Transport::Tcp => {
                let permit = self.reserve_stream()?;
                let stream = self.connect(key).await?;
                let binding = BindingInfo::new(stream.local_addr()?, key.remote, Transport::Tcp, network);
                let (reader, writer) = stream.into_split();
                let connection = self.stream_connection(binding, Direction::Outgoing, writer);
                self.attach_hook(key.clone(), &connection, Some(permit));
                self.spawn_reader(&connection, reader);
                connection
            }
            #[cfg(feature = "tls")]
            Transport::Tls => {
                let permit = self.reserve_stream()?;
                let tls = self.tls()?;
                let stream = self.connect(key).await?;
                let local = stream.local_addr()?;
                let stream = tls.connect(server_name, key.remote, stream).await?;
                let binding = BindingInfo::new(local, key.remote, Transport::Tls, network);
                let (reader, writer) = tokio::io::split(stream);
                let connection = self.stream_connection(binding, Direction::Outgoing, writer);
                self.attach_hook(key.clone(), &connection, Some(permit));
                self.spawn_reader(&connection, reader);
                connection
            }
            other => return Err(Error::UnsupportedTransport(other)),
        };
        #[cfg(not(feature = "tls"))]
        let _ = server_name;

        info!("Opened {} for {}", connection.key(), key);
        Ok(connection)
    }

    async fn create_datagram(&self, network: &str, key: &ConnectionKey) -> Result<Arc<SipConnection>> {
        let (socket, private) = match self.shared_udp_socket(key) {
            Some(socket) => (socket, false),
            None => {
                let bind = key
                    .local_bind_addr()
                    .unwrap_or_else(|| SocketAddr::new(unspecified_like(&key.remote), 0));
                let socket = UdpSocket::bind(bind)
                    .await
                    .map_err(|e| Error::connection_failed(key.remote, Transport::Udp, e))?;
                if let Err(e) = self.inner.tuner.tune_datagram(&socket) {
                    warn!("Could not tune UDP socket {}: {}", bind, e);
                }
                (Arc::new(socket), true)
            }
        };

        let binding = BindingInfo::new(socket.local_addr()?, key.remote, Transport::Udp, network);
        let connection = Arc::new(SipConnection::new(
            binding,
            Direction::Outgoing,
            self.inner.config.idle_timeout(Transport::Udp),
            self.inner.config.lock_wait_buffer(),
            Box::new(DatagramChannel::new(socket.clone())),
        ));

        self.attach_hook(key.clone(), &connection, None);

        // A socket of our own needs its own reader; it stops when the connection closes
        if private {
            spawn_datagram_reader(
                socket,
                network.to_string(),
                self.inner.config.max_udp_packet_size,
                self.inbound(),
                connection.shutdown_token(),
            )?;
        }
        Ok(connection)
    }

    /// A registered listening socket to send from, so replies leave the listening port
    fn shared_udp_socket(&self, key: &ConnectionKey) -> Option<Arc<UdpSocket>> {
        let sockets: Vec<(SocketAddr, Arc<UdpSocket>)> = self
            .inner
            .udp_sockets
            .iter()
            .filter(|entry| entry.key().is_ipv4() == key.remote.is_ipv4())
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let exact = |addr: &SocketAddr| Some(addr.ip()) == key.local_addr && Some(addr.port()) == key.local_port;
        let compatible = |addr: &SocketAddr| {
            key.local_port.map_or(true, |port| port == addr.port())
                && key
                    .local_addr
                    .map_or(true, |ip| ip == addr.ip() || addr.ip().is_unspecified())
        };

        sockets
            .iter()
            .find(|(addr, _)| exact(addr))
            .or_else(|| sockets.iter().find(|(addr, _)| compatible(addr)))
            .map(|(_, socket)| socket.clone())
    }

    async fn connect(&self, key: &ConnectionKey) -> Result<TcpStream> {
        let stream = connect_tcp(key.local_bind_addr(), key.remote, self.inner.config.connect_timeout()).await?;
        if let Err(e) = self.inner.tuner.tune_stream(&stream) {
            warn!("Could not tune stream to {}: {}", key.remote, e);
        }
        Ok(stream)
    }

    #[cfg(feature = "tls")]
    fn tls(&self) -> Result<Arc<TlsContext>> {
        self.inner
            .tls
            .clone()
            .ok_or_else(|| Error::tls("no TLS context configured"))
    }

    /// True when a server certificate is loaded for TLS listeners
    #[cfg(feature = "tls")]
    pub fn can_accept_tls(&self) -> bool {
        self.inner.tls.as_ref().map_or(false, |tls| tls.can_accept())
    }

    /// Take one of the `max_stream_connections` slots until the permit drops
    fn reserve_stream(&self) -> Result<StreamPermit> {
        let limit = self.inner.config.max_stream_connections;
        let open = &self.inner.open_streams;
        if open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < limit).then_some(count + 1)
            })
            .is_err()
        {
            warn!("Refusing new stream connection, {} open", limit);
            return Err(Error::ConnectionLimit { limit });
        }
        Ok(StreamPermit { open: open.clone() })
    }

    fn stream_connection<W>(&self, binding: BindingInfo, direction: Direction, writer: W) -> Arc<SipConnection>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let transport = binding.transport;
        Arc::new(SipConnection::new(
            binding,
            direction,
            self.inner.config.idle_timeout(transport),
            self.inner.config.lock_wait_buffer(),
            Box::new(StreamChannel::new(writer)),
        ))
    }

    /// Start reading; the hook must already be attached so no close goes unseen
    fn spawn_reader<R>(&self, connection: &Arc<SipConnection>, reader: R)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        spawn_stream_reader(
            reader,
            connection.clone(),
            self.inner.config.max_stream_message_size,
            self.inbound(),
        );
    }

    fn attach_hook(&self, key: ConnectionKey, connection: &Arc<SipConnection>, permit: Option<StreamPermit>) {
        connection.subscribe(Arc::new(RegistryHook {
            registry: Arc::downgrade(&self.inner),
            key,
            permit: Mutex::new(permit),
        }));
    }

    /// Register an accepted TCP stream and start reading from it
    pub(crate) async fn adopt_tcp(&self, network: &str, stream: TcpStream) -> Result<Arc<SipConnection>> {
        let permit = self.reserve_stream()?;
        if let Err(e) = self.inner.tuner.tune_stream(&stream) {
            warn!("Could not tune accepted stream: {}", e);
        }
        let binding = BindingInfo::new(stream.local_addr()?, stream.peer_addr()?, Transport::Tcp, network);
        let (reader, writer) = stream.into_split();
        let connection = self.stream_connection(binding, Direction::Incoming, writer);
        self.register_incoming(connection.clone(), Some(permit)).await;
        self.spawn_reader(&connection, reader);
        Ok(connection)
    }

    /// Complete the server handshake on an accepted stream, then register it
    #[cfg(feature = "tls")]
    pub(crate) async fn adopt_tls(&self, network: &str, stream: TcpStream) -> Result<Arc<SipConnection>> {
        let permit = self.reserve_stream()?;
        let tls = self.tls()?;
        if let Err(e) = self.inner.tuner.tune_stream(&stream) {
            warn!("Could not tune accepted stream: {}", e);
        }
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        let stream = tls.accept(remote, stream).await?;
        let binding = BindingInfo::new(local, remote, Transport::Tls, network);
        let (reader, writer) = tokio::io::split(stream);
        let connection = self.stream_connection(binding, Direction::Incoming, writer);
        self.register_incoming(connection.clone(), Some(permit)).await;
        self.spawn_reader(&connection, reader);
        Ok(connection)
    }

    /// Add a connection opened by the peer under its own key
    ///
    /// A live connection already registered under that key is closed.
    async fn register_incoming(&self, connection: Arc<SipConnection>, permit: Option<StreamPermit>) {
        let key = connection.key().clone();
        self.attach_hook(key.clone(), &connection, permit);
        let slot = Arc::new(OnceCell::new_with(Some(connection.clone())));
        let displaced = self
            .inner
            .connections
            .insert(key.clone(), slot)
            .and_then(|slot| slot.get().cloned());

        match displaced {
            Some(old) if !Arc::ptr_eq(&old, &connection) => {
                debug!("Incoming connection replaced the entry for {}, closing the old one", key);
                old.close().await;
            }
            _ => info!("Accepted {}", key),
        }
    }

    /// Make a listening socket available to outbound UDP connections
    pub fn register_udp_socket(&self, socket: Arc<UdpSocket>) -> Result<()> {
        let local = socket.local_addr()?;
        if let Err(e) = self.inner.tuner.tune_datagram(&socket) {
            warn!("Could not tune UDP socket {}: {}", local, e);
        }
        self.inner.udp_sockets.insert(local, socket);
        debug!("Registered UDP socket {}", local);
        Ok(())
    }

    pub fn unregister_udp_socket(&self, local: SocketAddr) -> bool {
        self.inner.udp_sockets.remove(&local).is_some()
    }

    /// Close every unreferenced connection idle past its timeout
    ///
    /// Returns how many were reaped. Each one is marked closed in the same
    /// step that checks its reference count, so a concurrent
    /// `add_reference` either wins and keeps it alive or fails.
    pub async fn sweep_idle(&self, now: Instant) -> usize {
        let candidates: Vec<Arc<SipConnection>> = self
            .inner
            .connections
            .iter()
            .filter_map(|entry| entry.value().get().cloned())
            .filter(|connection| connection.should_close(now))
            .collect();

        let mut reaped = 0;
        for connection in candidates {
            if connection.try_reap(now) {
                debug!("Reaping idle {}", connection.key());
                connection
                    .finish_close(ConnectionEvent::Closed {
                        connection: connection.clone(),
                    })
                    .await;
                reaped += 1;
            }
        }
        if reaped > 0 {
            info!("Reaped {} idle connections", reaped);
        }
        reaped
    }

    /// Run [`sweep_idle`](Self::sweep_idle) every sweep interval until `cancel` fires
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        let period = self.inner.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.sweep_idle(Instant::now()).await;
                    }
                }
            }
            debug!("Idle sweeper stopped");
        })
    }

    /// Close UDP connections to `remote` after an ICMP unreachable from outside the socket layer
    pub async fn notify_icmp_error(&self, remote: SocketAddr) -> usize {
        let targets: Vec<Arc<SipConnection>> = self
            .inner
            .connections
            .iter()
            .filter_map(|entry| entry.value().get().cloned())
            .filter(|connection| connection.transport() == Transport::Udp && connection.remote_addr() == remote)
            .collect();

        let count = targets.len();
        for connection in targets {
            connection
                .terminate(ConnectionEvent::IcmpError {
                    connection: connection.clone(),
                    reason: "destination unreachable".to_string(),
                })
                .await;
        }
        count
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for entry in self.inner.connections.iter() {
            let Some(connection) = entry.value().get() else {
                continue;
            };
            if connection.is_closed() {
                continue;
            }
            match connection.transport() {
                Transport::Udp => stats.udp += 1,
                Transport::Tcp => stats.tcp += 1,
                Transport::Tls => stats.tls += 1,
                _ => {}
            }
        }
        stats
    }

    /// Registered connections, including any that are closing
    pub fn len(&self) -> usize {
        self.inner
            .connections
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close everything, notifying subscribers
    pub async fn close_all(&self) {
        let all: Vec<Arc<SipConnection>> = self
            .inner
            .connections
            .iter()
            .filter_map(|entry| entry.value().get().cloned())
            .collect();
        for connection in all {
            connection.close().await;
        }
        self.inner.connections.clear();
    }

    /// Subscribe to events from every registered connection
    pub fn subscribe(&self, listener: Arc<dyn ConnectionEventListener>) -> ListenerId {
        self.inner.listeners.add(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("network", &self.inner.config.network)
            .field("stats", &self.stats())
            .finish()
    }
}
