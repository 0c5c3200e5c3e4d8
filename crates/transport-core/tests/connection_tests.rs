//! Connection registry and ingestion integration tests
//!
//! These run over loopback sockets with a real [`TransportContext`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

use rvoip_transport_core::connection::ChannelListener;
use rvoip_transport_core::dns::StaticDnsLookup;
use rvoip_transport_core::{
    ConnectionRegistry, MessageIntake, Transport, TransportConfig, TransportContext, UnitOfWork,
};

const WAIT: Duration = Duration::from_secs(2);

/// Forwards every unit of work to the test
struct Collect(mpsc::UnboundedSender<UnitOfWork>);

#[async_trait]
impl MessageIntake for Collect {
    async fn process(&self, work: UnitOfWork) {
        let _ = self.0.send(work);
    }
}

fn context() -> (TransportContext, mpsc::UnboundedReceiver<UnitOfWork>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let config = TransportConfig::new("test").with_workers(1, 64);
    let ctx = TransportContext::builder(config)
        .dns(Arc::new(StaticDnsLookup::new()))
        .build(Arc::new(Collect(tx)))
        .unwrap();
    (ctx, rx)
}

#[tokio::test]
async fn test_udp_keepalive_ping_gets_pong() {
    let (ctx, _work) = context();
    let listener = ctx.bind_udp("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    peer.send_to(b"\r\n\r\n", listener.local_addr()).await.unwrap();
    let mut buf = [0u8; 16];
    let (len, from) = timeout(WAIT, peer.recv_from(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..len], b"\r\n");
    assert_eq!(from, listener.local_addr());

    // A pong is absorbed without a reply
    peer.send_to(b"\r\n", listener.local_addr()).await.unwrap();
    assert!(timeout(Duration::from_millis(200), peer.recv_from(&mut buf)).await.is_err());

    assert_eq!(ctx.registry().stats().udp, 1);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_udp_message_reaches_intake() {
    let (ctx, mut work) = context();
    let listener = ctx.bind_udp("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let message = b"OPTIONS sip:bob@example.com SIP/2.0\r\nContent-Length: 0\r\n\r\n";
    peer.send_to(message, listener.local_addr()).await.unwrap();

    let unit = timeout(WAIT, work.recv()).await.unwrap().unwrap();
    assert_eq!(&unit.bytes[..], &message[..]);
    assert_eq!(unit.binding.transport, Transport::Udp);
    assert_eq!(unit.binding.remote, peer.local_addr().unwrap());
    assert_eq!(unit.binding.network, "test");
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_tcp_stream_is_framed() {
    let (ctx, mut work) = context();
    let listener = ctx.bind_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();

    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"OPTIONS sip:a@example.com SIP/2.0\r\nContent-Length: 0\r\n\r\n");
    bytes.extend_from_slice(b"MESSAGE sip:a@example.com SIP/2.0\r\nl: 5\r\n\r\nhello");
    bytes.extend_from_slice(b"\r\n\r\n");
    client.write_all(&bytes).await.unwrap();

    let first = timeout(WAIT, work.recv()).await.unwrap().unwrap();
    assert!(first.bytes.starts_with(b"OPTIONS"));
    let second = timeout(WAIT, work.recv()).await.unwrap().unwrap();
    assert!(second.bytes.starts_with(b"MESSAGE"));
    assert!(second.bytes.ends_with(b"hello"));
    assert_eq!(second.binding.transport, Transport::Tcp);

    // The trailing double CRLF is a ping
    let mut pong = [0u8; 2];
    timeout(WAIT, client.read_exact(&mut pong)).await.unwrap().unwrap();
    assert_eq!(&pong, b"\r\n");

    assert_eq!(ctx.registry().stats().tcp, 1);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_idle_connection_reaped_after_last_lease() {
    let config = TransportConfig::new("test").with_idle_timeouts(Duration::from_secs(1), Duration::from_secs(1));
    let registry = ConnectionRegistry::new(config);
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let remote = peer.local_addr().unwrap();

    let lease = registry
        .get_connection("test", None, None, remote.ip(), remote.port(), Transport::Udp, true)
        .await
        .unwrap()
        .unwrap();
    let second = registry
        .get_connection("test", None, None, remote.ip(), remote.port(), Transport::Udp, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lease.reference_count(), 2);

    assert_eq!(registry.sweep_idle(Instant::now() + Duration::from_secs(30)).await, 0);
    drop(second);
    assert_eq!(registry.sweep_idle(Instant::now() + Duration::from_secs(30)).await, 0);

    let connection = lease.connection().clone();
    drop(lease);
    assert_eq!(connection.reference_count(), 0);
    assert_eq!(registry.sweep_idle(Instant::now() + Duration::from_millis(500)).await, 0);
    assert_eq!(registry.sweep_idle(Instant::now() + Duration::from_secs(2)).await, 1);
    assert!(connection.is_closed());
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_peer_close_notifies_listeners() {
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = server.local_addr().unwrap();
    let registry = ConnectionRegistry::new(TransportConfig::new("test"));
    let (listener, mut events) = ChannelListener::new();
    registry.subscribe(listener);

    let lease = registry
        .get_connection("test", None, None, remote.ip(), remote.port(), Transport::Tcp, true)
        .await
        .unwrap()
        .unwrap();
    let (accepted, _) = server.accept().await.unwrap();
    drop(accepted);

    let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(event.kind(), "CLOSED");
    assert!(std::sync::Arc::ptr_eq(event.connection(), lease.connection()));
    assert!(lease.is_closed());
    assert!(registry.is_empty());

    // A fresh lookup does not hand back the closed connection
    let found = registry
        .get_connection("test", None, None, remote.ip(), remote.port(), Transport::Tcp, false)
        .await
        .unwrap();
    assert!(found.is_none());
}
