use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::ConnectionRegistry;
#[cfg(feature = "tls")]
use crate::error::Error;
use crate::error::Result;
use crate::transport::Transport;

/// Pause after a failed accept so descriptor exhaustion does not spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// TCP or TLS listening socket
///
/// Accepted connections are registered with the registry as incoming
/// connections; their messages reach the registry's inbound handler.
#[derive(Clone)]
pub struct StreamListener {
    inner: Arc<StreamListenerInner>,
}

struct StreamListenerInner {
    local_addr: SocketAddr,
    transport: Transport,
    cancel: CancellationToken,
}

impl StreamListener {
    /// Listen for TCP connections on `addr`
    pub async fn bind_tcp(addr: SocketAddr, registry: ConnectionRegistry, cancel: &CancellationToken) -> Result<Self> {
        Self::bind(addr, Transport::Tcp, registry, cancel).await
    }

    /// Listen for TLS connections on `addr`; the registry must hold a server certificate
    #[cfg(feature = "tls")]
    pub async fn bind_tls(addr: SocketAddr, registry: ConnectionRegistry, cancel: &CancellationToken) -> Result<Self> {
        if !registry.can_accept_tls() {
            return Err(Error::tls("TLS listener needs tls.cert_path and tls.key_path"));
        }
        Self::bind(addr, Transport::Tls, registry, cancel).await
    }

    async fn bind(
        addr: SocketAddr,
        transport: Transport,
        registry: ConnectionRegistry,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("SIP {} listener bound to {}", transport, local_addr);

        let cancel = cancel.child_token();
        let accept_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, remote)) => {
                        debug!("Accepted {} connection from {}", transport, remote);
                        adopt(&registry, transport, stream, remote).await;
                    }
                    Err(e) => {
                        error!("Error accepting on {}: {}", local_addr, e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
            info!("{} accept loop on {} terminated", transport, local_addr);
        });

        Ok(Self {
            inner: Arc::new(StreamListenerInner {
                local_addr,
                transport,
                cancel,
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn transport(&self) -> Transport {
        self.inner.transport
    }

    /// Stop accepting; established connections stay open
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }
}

async fn adopt(registry: &ConnectionRegistry, transport: Transport, stream: TcpStream, remote: SocketAddr) {
    let network = registry.config().network.clone();
    match transport {
        Transport::Tcp => {
            if let Err(e) = registry.adopt_tcp(&network, stream).await {
                warn!("Dropping TCP connection from {}: {}", remote, e);
            }
        }
        #[cfg(feature = "tls")]
        Transport::Tls => {
            // Handshakes run off the accept loop
            let registry = registry.clone();
            tokio::spawn(async move {
                if let Err(e) = registry.adopt_tls(&network, stream).await {
                    warn!("Dropping TLS connection from {}: {}", remote, e);
                }
            });
        }
        other => warn!("No accept handling for {}, dropping {}", other, remote),
    }
}

impl fmt::Debug for StreamListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamListener({} {})", self.inner.transport, self.inner.local_addr)
    }
}
