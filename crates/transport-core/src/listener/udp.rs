use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::connection::{spawn_datagram_reader, ConnectionRegistry};
use crate::error::Result;
use crate::ingest::InboundHandler;

/// UDP listening socket
#[derive(Clone)]
pub struct UdpListener {
    inner: Arc<UdpListenerInner>,
}

struct UdpListenerInner {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    registry: ConnectionRegistry,
    cancel: CancellationToken,
}

impl UdpListener {
    /// Bind `addr`, register the socket and start its receive loop
    ///
    /// The loop stops when `cancel` fires or [`close`](Self::close) is called.
    pub async fn bind(
        addr: SocketAddr,
        registry: ConnectionRegistry,
        inbound: &Arc<dyn InboundHandler>,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        info!("SIP UDP listener bound to {}", local_addr);

        registry.register_udp_socket(socket.clone())?;

        let cancel = cancel.child_token();
        let config = registry.config();
        spawn_datagram_reader(
            socket.clone(),
            config.network.clone(),
            config.max_udp_packet_size,
            Arc::downgrade(inbound),
            cancel.clone(),
        )?;

        Ok(Self {
            inner: Arc::new(UdpListenerInner {
                socket,
                local_addr,
                registry,
                cancel,
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// The bound socket, shared with outbound UDP connections
    pub fn socket(&self) -> Arc<UdpSocket> {
        self.inner.socket.clone()
    }

    /// Stop receiving and withdraw the socket from the registry
    pub fn close(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.registry.unregister_udp_socket(self.inner.local_addr);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }
}

impl fmt::Debug for UdpListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UdpListener({})", self.inner.local_addr)
    }
}
