//! SIP transport core for the rvoip stack
//!
//! This crate turns a logical SIP destination into an ordered list of hops
//! (RFC 3263 NAPTR/SRV/A resolution with RFC 2782 weighted selection) and
//! manages the UDP, TCP and TLS connections those hops are reached over:
//! reference counting, idle reaping, close/error notification and the hand
//! off of inbound bytes to the transaction layer.
//!
//! ```no_run
//! use std::sync::Arc;
//! use rvoip_transport_core::prelude::*;
//!
//! struct Print;
//!
//! #[async_trait::async_trait]
//! impl MessageIntake for Print {
//!     async fn process(&self, work: UnitOfWork) {
//!         println!("{} bytes from {}", work.bytes.len(), work.binding.remote);
//!     }
//! }
//!
//! # async fn run() -> Result<()> {
//! let ctx = TransportContext::builder(TransportConfig::new("external")).build(Arc::new(Print))?;
//! ctx.bind_udp("0.0.0.0:5060".parse().unwrap()).await?;
//!
//! let destination = SipDestination::new("example.com", TransportLookupType::Any);
//! let hop = ctx.send_to_destination(&destination, b"OPTIONS sip:example.com SIP/2.0\r\n\r\n").await?;
//! println!("sent via {}", hop);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod context;
pub mod dns;
pub mod error;
pub mod ingest;
pub mod listener;
pub mod locator;
pub mod logging;
pub mod transport;

// Re-export commonly used types
pub use config::{TlsSettings, TransportConfig};
pub use connection::{
    BindingInfo, ConnectionEvent, ConnectionEventListener, ConnectionKey, ConnectionLease,
    ConnectionRegistry, SipConnection,
};
pub use context::{TransportContext, TransportContextBuilder};
pub use error::{DnsError, Error, Result};
pub use ingest::{IngestPipeline, MessageIntake, UnitOfWork};
pub use locator::{DestinationResolver, Hop, ResolutionResult, SipDestination};
pub use transport::{Transport, TransportLookupType};

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        BindingInfo, ConnectionEvent, ConnectionEventListener, ConnectionLease, ConnectionRegistry,
        DestinationResolver, DnsError, Error, Hop, MessageIntake, ResolutionResult, Result,
        SipConnection, SipDestination, Transport, TransportConfig, TransportContext,
        TransportLookupType, UnitOfWork,
        dns::{DnsLookup, StaticDnsLookup},
        listener::{StreamListener, UdpListener},
    };
}
