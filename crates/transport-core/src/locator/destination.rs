use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::transport::{Transport, TransportLookupType};

/// Logical target handed to the resolver
///
/// Built by the caller from a request URI or a configured route. The
/// optional `id` selects per-user DNS injection overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SipDestination {
    address: String,
    port: Option<u16>,
    transport_lookup_type: TransportLookupType,
    id: Option<String>,
}

impl SipDestination {
    /// Create a destination with no port and no id
    pub fn new(address: impl Into<String>, transport_lookup_type: TransportLookupType) -> Self {
        Self {
            address: address.into(),
            port: None,
            transport_lookup_type,
            id: None,
        }
    }

    /// Set the port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the id used to select DNS injection overrides
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn transport_lookup_type(&self) -> TransportLookupType {
        self.transport_lookup_type
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// The address as an IP literal, accepting bracketed IPv6
    pub fn ip_addr(&self) -> Option<IpAddr> {
        let trimmed = self
            .address
            .strip_prefix('[')
            .and_then(|a| a.strip_suffix(']'))
            .unwrap_or(&self.address);
        trimmed.parse().ok()
    }

    /// Hostname lookups skip NAPTR/SRV when the caller pinned a transport and port
    pub(crate) fn is_direct_hostname(&self) -> bool {
        self.port.is_some() && self.transport_lookup_type.is_constrained()
    }

    /// Whether resolving this destination involves NAPTR/SRV queries
    pub fn should_search(&self) -> bool {
        self.ip_addr().is_none() && !self.is_direct_hostname()
    }

    /// Transport used when no SRV data says otherwise
    pub fn inferred_transport(&self) -> Transport {
        self.transport_lookup_type.infer_transport(self.port)
    }
}

impl fmt::Display for SipDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{} ({})", self.address, port, self.transport_lookup_type),
            None => write!(f, "{} ({})", self.address, self.transport_lookup_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_detection() {
        let v4 = SipDestination::new("203.0.113.5", TransportLookupType::Udp);
        assert_eq!(v4.ip_addr(), Some("203.0.113.5".parse().unwrap()));
        let v6 = SipDestination::new("[2001:db8::1]", TransportLookupType::Udp);
        assert_eq!(v6.ip_addr(), Some("2001:db8::1".parse().unwrap()));
        let host = SipDestination::new("example.com", TransportLookupType::Udp);
        assert!(host.ip_addr().is_none());
    }

    #[test]
    fn test_should_search() {
        assert!(!SipDestination::new("10.9.8.7", TransportLookupType::Tcp).should_search());
        assert!(!SipDestination::new("example.com", TransportLookupType::Tls)
            .with_port(5061)
            .should_search());
        assert!(SipDestination::new("example.com", TransportLookupType::Tls).should_search());
        assert!(SipDestination::new("example.com", TransportLookupType::Any)
            .with_port(5060)
            .should_search());
    }
}
