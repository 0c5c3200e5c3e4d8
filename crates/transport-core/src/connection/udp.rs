use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use super::connection::{is_icmp_error, Channel};
use super::key::BindingInfo;
use crate::ingest::InboundHandler;
use crate::transport::Transport;

/// Datagrams over a socket that may be shared with a listener
pub(crate) struct DatagramChannel {
    socket: Arc<UdpSocket>,
}

impl DatagramChannel {
    pub(crate) fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl Channel for DatagramChannel {
    async fn write(&self, bytes: &[u8], target: SocketAddr) -> io::Result<()> {
        let sent = self.socket.send_to(bytes, target).await?;
        if sent != bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("sent {} of {} bytes", sent, bytes.len()),
            ));
        }
        Ok(())
    }

    // The socket outlives any one peer; it closes when the last holder drops it
    async fn shutdown(&self) {}
}

/// Read datagrams from `socket` until `cancel` fires or the handler goes away
pub(crate) fn spawn_datagram_reader(
    socket: Arc<UdpSocket>,
    network: String,
    max_packet_size: usize,
    inbound: Weak<dyn InboundHandler>,
    cancel: CancellationToken,
) -> io::Result<tokio::task::JoinHandle<()>> {
    let local = socket.local_addr()?;
    Ok(tokio::spawn(async move {
        let mut buf = vec![0u8; max_packet_size];
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => received,
            };

            match received {
                Ok((len, remote)) => {
                    trace!("Received {} bytes on {} from {}", len, local, remote);
                    let Some(handler) = inbound.upgrade() else {
                        debug!("Inbound handler gone, stopping reader on {}", local);
                        break;
                    };
                    let binding = BindingInfo::new(local, remote, Transport::Udp, network.clone());
                    handler
                        .on_inbound(Bytes::copy_from_slice(&buf[..len]), binding, None)
                        .await;
                }
                // Some platforms report an earlier ICMP unreachable on the next read
                Err(e) if is_icmp_error(&e) || e.kind() == io::ErrorKind::ConnectionReset => {
                    debug!("ICMP error reported on {}: {}", local, e);
                }
                Err(e) => {
                    error!("Error receiving UDP packet on {}: {}", local, e);
                }
            }
        }
        info!("UDP receive loop on {} terminated", local);
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collect {
        seen: Mutex<Vec<(Bytes, BindingInfo)>>,
    }

    #[async_trait]
    impl InboundHandler for Collect {
        async fn on_inbound(&self, bytes: Bytes, binding: BindingInfo, _connection: Option<Arc<super::super::SipConnection>>) {
            self.seen.lock().push((bytes, binding));
        }
    }

    #[tokio::test]
    async fn test_reader_delivers_datagrams() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let local = socket.local_addr().unwrap();
        let collect = Arc::new(Collect::default());
        let handler: Arc<dyn InboundHandler> = collect.clone();
        let cancel = CancellationToken::new();
        let reader = spawn_datagram_reader(socket, "test".into(), 1500, Arc::downgrade(&handler), cancel.clone()).unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"REGISTER sip:example.com SIP/2.0\r\n\r\n", local).await.unwrap();

        for _ in 0..100 {
            if !collect.seen.lock().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        {
            let seen = collect.seen.lock();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].1.remote, peer.local_addr().unwrap());
            assert_eq!(seen[0].1.network, "test");
        }

        cancel.cancel();
        reader.await.unwrap();
    }
}
