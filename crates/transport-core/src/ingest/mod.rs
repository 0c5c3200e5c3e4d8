//! Inbound message hand-off
//!
//! Readers pass every received datagram or framed stream message to an
//! [`InboundHandler`]. The [`IngestPipeline`] answers keepalives on the spot
//! and queues everything else on the SIP processing lane for the
//! [`MessageIntake`] collaborator, so readers go straight back to reading.

pub mod executor;
pub mod framing;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

pub use executor::{ExecutorRole, ExecutorService, Job, SubmitError};
pub use framing::SipStreamFramer;

use crate::connection::{BindingInfo, ConnectionLease, ConnectionRegistry, SipConnection, KEEPALIVE_PONG};
use crate::error::{Error, Result};

/// One inbound message on its way to the transaction layer
#[derive(Debug, Clone)]
pub struct UnitOfWork {
    pub bytes: Bytes,
    pub binding: BindingInfo,
    pub created_at: Instant,
}

impl UnitOfWork {
    pub fn new(bytes: Bytes, binding: BindingInfo) -> Self {
        Self {
            bytes,
            binding,
            created_at: Instant::now(),
        }
    }
}

/// The transaction layer's entry point
///
/// Runs on a worker; a slow implementation holds up that worker only.
#[async_trait]
pub trait MessageIntake: Send + Sync {
    async fn process(&self, work: UnitOfWork);
}

/// Receiver of bytes read by listeners and connection readers
///
/// `connection` is set when the bytes came from a known connection (stream
/// readers) and `None` for datagrams read from a shared socket.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_inbound(&self, bytes: Bytes, binding: BindingInfo, connection: Option<Arc<SipConnection>>);
}

/// Payloads treated as keepalives instead of messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keepalive {
    /// Expects a CRLF reply
    Ping,
    /// A CRLF reply to our own ping
    Pong,
}

/// Classify `bytes`: empty, or shorter than `max_size` and made only of
/// CR/LF/whitespace, is a keepalive
pub fn keepalive_kind(bytes: &[u8], max_size: usize) -> Option<Keepalive> {
    if bytes == KEEPALIVE_PONG {
        return Some(Keepalive::Pong);
    }
    if bytes.is_empty() || (bytes.len() < max_size && bytes.iter().all(u8::is_ascii_whitespace)) {
        return Some(Keepalive::Ping);
    }
    None
}

/// Routes inbound bytes to keepalive handling or the processing lane
pub struct IngestPipeline {
    registry: ConnectionRegistry,
    executor: Arc<ExecutorService>,
    intake: Arc<dyn MessageIntake>,
    max_keepalive_size: usize,
    respond_to_keepalive: bool,
}

impl IngestPipeline {
    pub fn new(registry: ConnectionRegistry, executor: Arc<ExecutorService>, intake: Arc<dyn MessageIntake>) -> Self {
        let config = registry.config();
        let max_keepalive_size = config.max_keepalive_size;
        let respond_to_keepalive = config.respond_to_keepalive;
        Self {
            registry,
            executor,
            intake,
            max_keepalive_size,
            respond_to_keepalive,
        }
    }

    /// Hand `bytes` off; returns once the message is queued or the keepalive answered
    pub async fn ingest(&self, bytes: Bytes, binding: BindingInfo, connection: Option<Arc<SipConnection>>) {
        if let Some(kind) = keepalive_kind(&bytes, self.max_keepalive_size) {
            if let Err(e) = self.handle_keepalive(kind, &binding, connection).await {
                warn!("Keepalive from {} not handled: {}", binding.remote, e);
            }
            return;
        }

        trace!("Queueing {} bytes from {}", bytes.len(), binding.remote);
        let remote = binding.remote;
        let work = UnitOfWork::new(bytes, binding);
        let intake = self.intake.clone();
        let job = Box::pin(async move { intake.process(work).await });
        match self.executor.submit(ExecutorRole::SipProcessing, job) {
            Ok(()) => {}
            Err(SubmitError::Full) => warn!("SIP processing queue full, dropping message from {}", remote),
            Err(SubmitError::Closed) => warn!("SIP processing lane stopped, dropping message from {}", remote),
        }
    }

    async fn handle_keepalive(
        &self,
        kind: Keepalive,
        binding: &BindingInfo,
        connection: Option<Arc<SipConnection>>,
    ) -> Result<()> {
        let lease = match connection {
            Some(connection) => ConnectionLease::acquire(connection),
            None => {
                self.registry
                    .get_connection(
                        &binding.network,
                        Some(binding.local.ip()),
                        Some(binding.local.port()),
                        binding.remote.ip(),
                        binding.remote.port(),
                        binding.transport,
                        true,
                    )
                    .await?
            }
        };
        let lease = lease.ok_or(Error::ConnectionClosed(binding.remote))?;

        lease.touch();
        debug!("{:?} keepalive from {}", kind, binding.remote);
        if kind == Keepalive::Ping && self.respond_to_keepalive {
            lease.send_keepalive_reply().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl InboundHandler for IngestPipeline {
    async fn on_inbound(&self, bytes: Bytes, binding: BindingInfo, connection: Option<Arc<SipConnection>>) {
        self.ingest(bytes, binding, connection).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keepalive_detection() {
        assert_eq!(keepalive_kind(b"", 10), Some(Keepalive::Ping));
        assert_eq!(keepalive_kind(b"\r\n\r\n", 10), Some(Keepalive::Ping));
        assert_eq!(keepalive_kind(b"\r\n", 10), Some(Keepalive::Pong));
        assert_eq!(keepalive_kind(b" \r\n \r\n ", 10), Some(Keepalive::Ping));
        assert_eq!(keepalive_kind(b"\r\n\r\n\r\n\r\n\r\n", 10), None);
        assert_eq!(keepalive_kind(b"OPTIONS", 10), None);
        assert_eq!(keepalive_kind(b"\r\nA", 10), None);
    }
}
