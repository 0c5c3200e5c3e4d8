//! Error types for the transport core
//!
//! Two families live here. [`DnsError`] describes a failed lookup from the DNS
//! collaborator; it is `Clone` because the resolver captures it on a
//! [`ResolutionResult`](crate::locator::ResolutionResult) instead of returning
//! it. [`Error`] covers everything a caller can see from connection
//! acquisition, sending and startup.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::transport::Transport;

/// Result type for transport core operations
pub type Result<T> = std::result::Result<T, Error>;

/// A failed DNS query, as reported by a [`DnsLookup`](crate::dns::DnsLookup)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DnsError {
    /// The query did not complete in time
    #[error("DNS {record_type} lookup for {name} timed out")]
    Timeout { name: String, record_type: &'static str },

    /// The server answered with an error code (SERVFAIL, REFUSED, ...)
    #[error("DNS {record_type} lookup for {name} failed: {reason}")]
    Failed {
        name: String,
        record_type: &'static str,
        reason: String,
    },

    /// The resolver could not be configured
    #[error("DNS resolver unavailable: {0}")]
    Unavailable(String),
}

impl DnsError {
    /// Create a lookup failure
    pub fn failed(name: impl Into<String>, record_type: &'static str, reason: impl Into<String>) -> Self {
        Self::Failed {
            name: name.into(),
            record_type,
            reason: reason.into(),
        }
    }

    /// Create a lookup timeout
    pub fn timeout(name: impl Into<String>, record_type: &'static str) -> Self {
        Self::Timeout {
            name: name.into(),
            record_type,
        }
    }
}

/// Errors that can occur in the transport core
#[derive(Debug, Error)]
pub enum Error {
    /// Socket level I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// DNS failure surfaced outside of resolution (resolver construction)
    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),

    /// TLS configuration error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Could not open a connection to the remote endpoint
    #[error("Failed to connect to {remote} over {transport}: {reason}")]
    ConnectionFailed {
        remote: SocketAddr,
        transport: Transport,
        reason: String,
    },

    /// The TLS handshake did not complete
    #[error("TLS handshake with {remote} failed: {reason}")]
    HandshakeFailed { remote: SocketAddr, reason: String },

    /// The connection was closed before or during the operation
    #[error("Connection to {0} is closed")]
    ConnectionClosed(SocketAddr),

    /// The send lock could not be taken within the buffer window
    #[error("Timed out after {waited:?} waiting for the send lock on {remote}")]
    LockTimeout { remote: SocketAddr, waited: Duration },

    /// A stream connection was asked to send somewhere other than its peer
    #[error("Connection to {bound} cannot send to {requested}")]
    DestinationMismatch {
        bound: SocketAddr,
        requested: SocketAddr,
    },

    /// Too many stream connections are open
    #[error("Stream connection limit of {limit} reached")]
    ConnectionLimit { limit: usize },

    /// The transport is not supported by this build or configuration
    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(Transport),

    /// Every resolved hop failed, or resolution produced none
    #[error("No reachable hop for {0}")]
    Unreachable(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The stream framer rejected inbound bytes
    #[error("Framing error: {0}")]
    Framing(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a TLS configuration error
    pub fn tls(message: impl Into<String>) -> Self {
        Self::Tls(message.into())
    }

    /// Create a connection failure
    pub fn connection_failed(remote: SocketAddr, transport: Transport, reason: impl ToString) -> Self {
        Self::ConnectionFailed {
            remote,
            transport,
            reason: reason.to_string(),
        }
    }

    /// True when the failure belongs to one connection, so the caller should
    /// move on to the next hop rather than give up.
    ///
    /// A transport this build cannot carry, or TLS without a usable context,
    /// rules out that hop only.
    pub fn is_per_connection(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::ConnectionFailed { .. }
                | Error::HandshakeFailed { .. }
                | Error::ConnectionClosed(_)
                | Error::LockTimeout { .. }
                | Error::ConnectionLimit { .. }
                | Error::UnsupportedTransport(_)
                | Error::Tls(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_connection_classification() {
        let remote: SocketAddr = "192.0.2.1:5060".parse().unwrap();
        assert!(Error::ConnectionClosed(remote).is_per_connection());
        assert!(Error::LockTimeout { remote, waited: Duration::from_millis(1000) }.is_per_connection());
        assert!(Error::UnsupportedTransport(Transport::Sctp).is_per_connection());
        assert!(Error::tls("no TLS context configured").is_per_connection());
        assert!(!Error::config("bad").is_per_connection());
        assert!(!Error::DestinationMismatch { bound: remote, requested: remote }.is_per_connection());
    }

    #[test]
    fn test_dns_error_display() {
        let err = DnsError::failed("example.com", "SRV", "SERVFAIL");
        assert_eq!(err.to_string(), "DNS SRV lookup for example.com failed: SERVFAIL");
        let err = DnsError::timeout("example.com", "NAPTR");
        assert_eq!(err.to_string(), "DNS NAPTR lookup for example.com timed out");
    }
}
