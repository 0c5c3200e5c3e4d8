//! Transport identifiers
//!
//! [`Transport`] names the wire protocol of a hop or connection.
//! [`TransportLookupType`] is the caller's hint to the resolver, which may be
//! broader than one transport (`TlsAndTcp`, `Any`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Default SIP port for UDP, TCP and SCTP
pub const DEFAULT_SIP_PORT: u16 = 5060;

/// Default SIP port for TLS
pub const DEFAULT_SIPS_PORT: u16 = 5061;

/// Wire transport of a hop or connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Transport {
    Udp,
    Tcp,
    Tls,
    Sctp,
    /// Unknown or unsupported service
    None,
}

impl Transport {
    /// The well-known port for this transport
    pub fn default_port(&self) -> u16 {
        match self {
            Transport::Tls => DEFAULT_SIPS_PORT,
            _ => DEFAULT_SIP_PORT,
        }
    }

    /// Stream transports keep a persistent connection to one peer
    pub fn is_reliable(&self) -> bool {
        matches!(self, Transport::Tcp | Transport::Tls | Transport::Sctp)
    }

    /// SRV service prefix used for direct SRV queries (RFC 3263 §4.1)
    pub fn srv_prefix(&self) -> Option<&'static str> {
        match self {
            Transport::Udp => Some("_sip._udp."),
            Transport::Tcp => Some("_sip._tcp."),
            Transport::Tls => Some("_sips._tcp."),
            Transport::Sctp => Some("_sip._sctp."),
            Transport::None => None,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Transport::Udp => "UDP",
            Transport::Tcp => "TCP",
            Transport::Tls => "TLS",
            Transport::Sctp => "SCTP",
            Transport::None => "NONE",
        };
        f.write_str(name)
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UDP" => Ok(Transport::Udp),
            "TCP" => Ok(Transport::Tcp),
            "TLS" => Ok(Transport::Tls),
            "SCTP" => Ok(Transport::Sctp),
            "NONE" => Ok(Transport::None),
            other => Err(format!("unknown transport: {}", other)),
        }
    }
}

/// Transport hint carried by a [`SipDestination`](crate::locator::SipDestination)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportLookupType {
    Udp,
    Tcp,
    Tls,
    Sctp,
    /// Prefer TLS, fall back to TCP
    TlsAndTcp,
    /// No constraint
    Any,
}

impl TransportLookupType {
    /// The single transport this hint names, if it names exactly one
    pub fn specific(&self) -> Option<Transport> {
        match self {
            TransportLookupType::Udp => Some(Transport::Udp),
            TransportLookupType::Tcp => Some(Transport::Tcp),
            TransportLookupType::Tls => Some(Transport::Tls),
            TransportLookupType::Sctp => Some(Transport::Sctp),
            TransportLookupType::TlsAndTcp | TransportLookupType::Any => None,
        }
    }

    /// True unless the hint is `Any`
    pub fn is_constrained(&self) -> bool {
        !matches!(self, TransportLookupType::Any)
    }

    /// Whether a record advertising `transport` is usable under this hint
    pub fn accepts(&self, transport: Transport) -> bool {
        if transport == Transport::None {
            return false;
        }
        match self {
            TransportLookupType::Any => true,
            TransportLookupType::TlsAndTcp => {
                matches!(transport, Transport::Tls | Transport::Tcp)
            }
            other => other.specific() == Some(transport),
        }
    }

    /// Transports to try with direct SRV queries, in preference order
    pub fn srv_transports(&self) -> Vec<Transport> {
        match self {
            TransportLookupType::TlsAndTcp => vec![Transport::Tls, Transport::Tcp],
            TransportLookupType::Any => vec![Transport::Tls, Transport::Tcp, Transport::Udp],
            other => other.specific().into_iter().collect(),
        }
    }

    /// Transport to use when the target is reached without SRV data
    ///
    /// `TlsAndTcp` picks TCP for the standard SIP port (or no port) and TLS
    /// otherwise.
    pub fn infer_transport(&self, port: Option<u16>) -> Transport {
        match self {
            TransportLookupType::Any => Transport::Udp,
            TransportLookupType::TlsAndTcp => match port {
                None | Some(DEFAULT_SIP_PORT) => Transport::Tcp,
                Some(_) => Transport::Tls,
            },
            other => other.specific().unwrap_or(Transport::Udp),
        }
    }
}

impl fmt::Display for TransportLookupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportLookupType::Udp => "UDP",
            TransportLookupType::Tcp => "TCP",
            TransportLookupType::Tls => "TLS",
            TransportLookupType::Sctp => "SCTP",
            TransportLookupType::TlsAndTcp => "TLS_AND_TCP",
            TransportLookupType::Any => "ANY",
        };
        f.write_str(name)
    }
}

impl From<Transport> for TransportLookupType {
    fn from(transport: Transport) -> Self {
        match transport {
            Transport::Udp => TransportLookupType::Udp,
            Transport::Tcp => TransportLookupType::Tcp,
            Transport::Tls => TransportLookupType::Tls,
            Transport::Sctp => TransportLookupType::Sctp,
            Transport::None => TransportLookupType::Any,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ports() {
        assert_eq!(Transport::Udp.default_port(), 5060);
        assert_eq!(Transport::Tcp.default_port(), 5060);
        assert_eq!(Transport::Tls.default_port(), 5061);
    }

    #[test]
    fn test_tls_and_tcp_inference() {
        let hint = TransportLookupType::TlsAndTcp;
        assert_eq!(hint.infer_transport(None), Transport::Tcp);
        assert_eq!(hint.infer_transport(Some(5060)), Transport::Tcp);
        assert_eq!(hint.infer_transport(Some(5061)), Transport::Tls);
        assert_eq!(hint.infer_transport(Some(5062)), Transport::Tls);
        assert_eq!(TransportLookupType::Any.infer_transport(Some(5061)), Transport::Udp);
    }

    #[test]
    fn test_accepts() {
        assert!(TransportLookupType::Any.accepts(Transport::Sctp));
        assert!(!TransportLookupType::Any.accepts(Transport::None));
        assert!(TransportLookupType::TlsAndTcp.accepts(Transport::Tcp));
        assert!(!TransportLookupType::TlsAndTcp.accepts(Transport::Udp));
        assert!(TransportLookupType::Udp.accepts(Transport::Udp));
        assert!(!TransportLookupType::Udp.accepts(Transport::Tcp));
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!("tls".parse::<Transport>().unwrap(), Transport::Tls);
        assert_eq!(Transport::Sctp.to_string(), "SCTP");
        assert!("ws".parse::<Transport>().is_err());
    }
}
