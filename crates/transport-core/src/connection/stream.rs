//! TCP and TLS byte streams
//!
//! Both transports split their stream: the write half sits behind the
//! connection as a [`StreamChannel`], the read half feeds a reader task that
//! frames messages and hands them to the inbound handler in arrival order.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::FramedRead;
use tracing::{debug, trace, warn};

use super::connection::{Channel, SipConnection};
use crate::error::{Error, Result};
use crate::ingest::{InboundHandler, SipStreamFramer};
use crate::transport::Transport;

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Write half of a TCP or TLS stream
pub(crate) struct StreamChannel {
    writer: Mutex<Writer>,
}

impl StreamChannel {
    pub(crate) fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Mutex::new(Box::new(writer)),
        }
    }
}

#[async_trait]
impl Channel for StreamChannel {
    async fn write(&self, bytes: &[u8], _target: SocketAddr) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            trace!("Stream shutdown: {}", e);
        }
    }
}

/// Open a TCP connection to `remote`, binding `local` first when given
pub(crate) async fn connect_tcp(local: Option<SocketAddr>, remote: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let socket = match remote {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }?;
    if let Some(local) = local {
        socket.set_reuseaddr(true)?;
        socket.bind(local)?;
    }

    match tokio::time::timeout(timeout, socket.connect(remote)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(Error::connection_failed(remote, Transport::Tcp, e)),
        Err(_) => Err(Error::connection_failed(
            remote,
            Transport::Tcp,
            format!("connect timed out after {:?}", timeout),
        )),
    }
}

/// Frame messages from `reader` until end of stream, a framing error, or close
pub(crate) fn spawn_stream_reader<R>(
    reader: R,
    connection: Arc<SipConnection>,
    max_message_size: usize,
    inbound: Weak<dyn InboundHandler>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let cancel = connection.shutdown_token();
    tokio::spawn(async move {
        let mut frames = FramedRead::new(reader, SipStreamFramer::new(max_message_size));
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = frames.next() => frame,
            };

            match frame {
                Some(Ok(message)) => {
                    connection.touch();
                    let Some(handler) = inbound.upgrade() else {
                        debug!("Inbound handler gone, closing {}", connection.key());
                        connection.close().await;
                        break;
                    };
                    handler
                        .on_inbound(message, connection.binding().clone(), Some(connection.clone()))
                        .await;
                }
                Some(Err(Error::Io(e))) => {
                    debug!("Read error on {}: {}", connection.key(), e);
                    connection.fail(&e).await;
                    break;
                }
                Some(Err(e)) => {
                    warn!("Framing error on {}: {}", connection.key(), e);
                    connection
                        .fail(&io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
                        .await;
                    break;
                }
                None => {
                    debug!("Peer closed {}", connection.key());
                    connection.close().await;
                    break;
                }
            }
        }
        trace!("Reader for {} stopped", connection.key());
    });
}
