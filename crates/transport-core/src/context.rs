//! The transport context
//!
//! [`TransportContext`] owns one instance of each service: registry,
//! resolver, executor and ingestion pipeline, plus the cancellation token
//! every background task hangs off. Tests build as many independent contexts
//! as they need.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
#[cfg(feature = "tls")]
use crate::connection::TlsContext;
use crate::connection::{ConnectionRegistry, SocketTuner};
use crate::dns::{DnsInjectionService, DnsLookup};
use crate::error::{Error, Result};
use crate::ingest::{ExecutorRole, ExecutorService, InboundHandler, IngestPipeline, MessageIntake};
use crate::listener::{StreamListener, UdpListener};
use crate::locator::{DestinationResolver, Hop, SipDestination};

/// How long shutdown waits for workers to finish their current job
const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Builder for [`TransportContext`]
pub struct TransportContextBuilder {
    config: TransportConfig,
    dns: Option<Arc<dyn DnsLookup>>,
    injection: Option<Arc<DnsInjectionService>>,
    tuner: Option<Arc<dyn SocketTuner>>,
    seed: Option<u64>,
}

impl TransportContextBuilder {
    /// DNS collaborator; defaults to the system resolver when the `dns` feature is on
    pub fn dns(mut self, dns: Arc<dyn DnsLookup>) -> Self {
        self.dns = Some(dns);
        self
    }

    pub fn injection(mut self, injection: Arc<DnsInjectionService>) -> Self {
        self.injection = Some(injection);
        self
    }

    pub fn tuner(mut self, tuner: Arc<dyn SocketTuner>) -> Self {
        self.tuner = Some(tuner);
        self
    }

    /// Seed weighted SRV selection for reproducible hop order
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Start the services; inbound messages go to `intake`
    ///
    /// Spawns the workers and the idle sweeper, so it must run inside a tokio runtime.
    pub fn build(self, intake: Arc<dyn MessageIntake>) -> Result<TransportContext> {
        let config = self.config;
        config.validate()?;
        let cancel = CancellationToken::new();

        let mut registry = ConnectionRegistry::builder(config.clone());
        if let Some(tuner) = self.tuner {
            registry = registry.tuner(tuner);
        }
        #[cfg(feature = "tls")]
        {
            let tls = TlsContext::from_settings(&config.tls, config.tls_handshake_timeout())?;
            registry = registry.tls(Arc::new(tls));
        }
        let registry = registry.build();

        let dns = match self.dns {
            Some(dns) => dns,
            None => default_dns(&config)?,
        };
        let mut resolver = DestinationResolver::new(dns);
        if let Some(injection) = self.injection {
            resolver = resolver.with_injection(injection);
        }
        if let Some(seed) = self.seed {
            resolver = resolver.with_seed(seed);
        }

        let executor = Arc::new(ExecutorService::new(cancel.child_token()));
        executor.start_lane(ExecutorRole::SipProcessing, config.worker_count, config.queue_capacity)?;

        let pipeline = Arc::new(IngestPipeline::new(registry.clone(), executor.clone(), intake));
        let inbound: Arc<dyn InboundHandler> = pipeline.clone();
        registry.set_inbound(&inbound);

        let sweeper = registry.spawn_sweeper(cancel.child_token());
        info!("Transport context for network {} started", config.network);

        Ok(TransportContext {
            config,
            registry,
            resolver: Arc::new(resolver),
            executor,
            pipeline,
            inbound,
            cancel,
            sweeper: Mutex::new(Some(sweeper)),
            udp_listeners: Mutex::new(Vec::new()),
            stream_listeners: Mutex::new(Vec::new()),
        })
    }
}

#[cfg(feature = "dns")]
fn default_dns(config: &TransportConfig) -> Result<Arc<dyn DnsLookup>> {
    let lookup = crate::dns::HickoryDnsLookup::from_system_conf(config.dns_timeout())?;
    Ok(Arc::new(lookup))
}

#[cfg(not(feature = "dns"))]
fn default_dns(_config: &TransportConfig) -> Result<Arc<dyn DnsLookup>> {
    Err(Error::config("no DNS lookup configured and the dns feature is off"))
}

/// Registry, resolver, executor and pipeline for one network
pub struct TransportContext {
    config: TransportConfig,
    registry: ConnectionRegistry,
    resolver: Arc<DestinationResolver>,
    executor: Arc<ExecutorService>,
    pipeline: Arc<IngestPipeline>,
    // Readers only hold a weak reference; this keeps the pipeline alive
    inbound: Arc<dyn InboundHandler>,
    cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    udp_listeners: Mutex<Vec<UdpListener>>,
    stream_listeners: Mutex<Vec<StreamListener>>,
}

impl TransportContext {
    pub fn builder(config: TransportConfig) -> TransportContextBuilder {
        TransportContextBuilder {
            config,
            dns: None,
            injection: None,
            tuner: None,
            seed: None,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn resolver(&self) -> &Arc<DestinationResolver> {
        &self.resolver
    }

    pub fn executor(&self) -> &Arc<ExecutorService> {
        &self.executor
    }

    pub fn pipeline(&self) -> &Arc<IngestPipeline> {
        &self.pipeline
    }

    /// Cancelled on shutdown
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn bind_udp(&self, addr: SocketAddr) -> Result<UdpListener> {
        let listener = UdpListener::bind(addr, self.registry.clone(), &self.inbound, &self.cancel).await?;
        self.udp_listeners.lock().push(listener.clone());
        Ok(listener)
    }

    pub async fn bind_tcp(&self, addr: SocketAddr) -> Result<StreamListener> {
        let listener = StreamListener::bind_tcp(addr, self.registry.clone(), &self.cancel).await?;
        self.stream_listeners.lock().push(listener.clone());
        Ok(listener)
    }

    #[cfg(feature = "tls")]
    pub async fn bind_tls(&self, addr: SocketAddr) -> Result<StreamListener> {
        let listener = StreamListener::bind_tls(addr, self.registry.clone(), &self.cancel).await?;
        self.stream_listeners.lock().push(listener.clone());
        Ok(listener)
    }

    /// Resolve `destination` and send `bytes` to the first hop that takes them
    ///
    /// Hops are tried in resolved order; a failure that belongs to one
    /// connection moves on to the next hop, anything else is returned as is.
    pub async fn send_to_destination(&self, destination: &SipDestination, bytes: &[u8]) -> Result<Hop> {
        let resolution = self.resolver.resolve(destination).await;
        if resolution.is_empty() {
            if let Some(e) = resolution.dns_error {
                return Err(Error::Dns(e));
            }
            return Err(Error::Unreachable(destination.address().to_string()));
        }

        for hop in resolution.hops {
            let lease = match self
                .registry
                .get_connection_for_hop(&self.config.network, &hop, true)
                .await
            {
                Ok(Some(lease)) => lease,
                Ok(None) => continue,
                Err(e) if e.is_per_connection() => {
                    warn!("Hop {} unavailable: {}", hop, e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            match lease.send_to(bytes, hop.host, hop.port).await {
                Ok(()) => {
                    debug!("Sent {} bytes to {}", bytes.len(), hop);
                    return Ok(hop);
                }
                Err(e) if e.is_per_connection() => warn!("Send to {} failed: {}", hop, e),
                Err(e) => return Err(e),
            }
        }
        Err(Error::Unreachable(destination.address().to_string()))
    }

    /// Stop listeners, close every connection and drain the workers
    pub async fn shutdown(&self) {
        info!("Shutting down transport context for network {}", self.config.network);
        for listener in self.udp_listeners.lock().drain(..) {
            listener.close();
        }
        for listener in self.stream_listeners.lock().drain(..) {
            listener.close();
        }
        self.cancel.cancel();

        self.registry.close_all().await;
        self.executor.shutdown(WORKER_DRAIN_TIMEOUT).await;

        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            if let Err(e) = sweeper.await {
                warn!("Idle sweeper ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for TransportContext {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionEventListener;
    use crate::dns::StaticDnsLookup;
    use crate::ingest::UnitOfWork;
    use crate::transport::TransportLookupType;
    use async_trait::async_trait;

    struct Discard;

    #[async_trait]
    impl MessageIntake for Discard {
        async fn process(&self, _work: UnitOfWork) {}
    }

    fn context(dns: Arc<StaticDnsLookup>) -> TransportContext {
        TransportContext::builder(TransportConfig::new("test"))
            .dns(dns)
            .seed(7)
            .build(Arc::new(Discard))
            .unwrap()
    }

    #[tokio::test]
    async fn test_send_skips_unreachable_hop() {
        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = peer.local_addr().unwrap().port();

        let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_port = dead.local_addr().unwrap().port();
        drop(dead);

        let dns = Arc::new(StaticDnsLookup::new());
        dns.add_srv("_sip._tcp.example.com", format!("0 0 {} dead.example.com", dead_port))
            .add_a("dead.example.com", "127.0.0.1".parse().unwrap());
        let ctx = context(dns);

        // TCP is refused, so nothing is sent
        let destination = SipDestination::new("example.com", TransportLookupType::Tcp);
        let err = ctx.send_to_destination(&destination, b"OPTIONS").await.unwrap_err();
        assert!(matches!(err, Error::Unreachable(_)));

        let destination = SipDestination::new("127.0.0.1", TransportLookupType::Udp).with_port(port);
        let hop = ctx.send_to_destination(&destination, b"OPTIONS").await.unwrap();
        assert_eq!(hop.port, port);
        let mut buf = [0u8; 16];
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"OPTIONS");

        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_skips_unsupported_transport_hop() {
        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = peer.local_addr().unwrap().port();

        let dns = Arc::new(StaticDnsLookup::new());
        dns.add_naptr("example.com", "1 10 \"s\" \"SIP+D2S\" \"\" _sip._sctp.example.com.")
            .add_naptr("example.com", "2 10 \"s\" \"SIP+D2U\" \"\" _sip._udp.example.com.")
            .add_srv("_sip._sctp.example.com", format!("0 0 {} sctp.example.com.", port))
            .add_srv("_sip._udp.example.com", format!("0 0 {} udp.example.com.", port))
            .add_a("sctp.example.com", "127.0.0.1".parse().unwrap())
            .add_a("udp.example.com", "127.0.0.1".parse().unwrap());
        let ctx = context(dns);

        let destination = SipDestination::new("example.com", TransportLookupType::Any);
        let hop = ctx.send_to_destination(&destination, b"OPTIONS").await.unwrap();
        assert_eq!(hop.transport, crate::Transport::Udp);
        assert_eq!(hop.hostname.as_deref(), Some("udp.example.com"));

        let mut buf = [0u8; 16];
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"OPTIONS");
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        struct Count(std::sync::atomic::AtomicUsize);
        impl ConnectionEventListener for Count {
            fn on_closed(&self, _event: &crate::connection::ConnectionEvent) {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let ctx = context(Arc::new(StaticDnsLookup::new()));
        let listener = ctx.bind_udp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let count = Arc::new(Count(Default::default()));
        ctx.registry().subscribe(count.clone());

        let lease = ctx
            .registry()
            .get_connection("test", None, None, "127.0.0.1".parse().unwrap(), 5999, crate::Transport::Udp, true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.local_addr(), listener.local_addr());
        drop(lease);

        ctx.shutdown().await;
        assert!(listener.is_closed());
        assert!(ctx.registry().is_empty());
        assert_eq!(count.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
