use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::Serialize;

use super::records::{DnsARecord, DnsSrvRecord, RecordSource};
use crate::error::DnsError;
use crate::transport::Transport;

/// How a resolution reached its hops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResolutionKind {
    /// The destination was a literal address
    Ip,
    /// A/AAAA lookup on the destination name
    Hostname,
    /// NAPTR and/or SRV records were followed
    Srv,
    /// Resolution stopped before the path was known
    Unknown,
}

/// One concrete target a sender may try
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Hop {
    /// Name the address was resolved from, `None` for literal destinations
    pub hostname: Option<String>,
    pub host: IpAddr,
    pub port: u16,
    pub transport: Transport,
    /// SRV priority, 0 when no SRV record was involved
    pub priority: u16,
    pub source: RecordSource,
}

impl Hop {
    pub fn new(host: IpAddr, port: u16, transport: Transport) -> Self {
        Self {
            hostname: None,
            host,
            port,
            transport,
            priority: 0,
            source: RecordSource::Dns,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.socket_addr(), self.transport)
    }
}

/// Ordered hops for one destination plus the records behind them
///
/// Callers try `hops` strictly in order and advance only on failure. A
/// result with no hops and a `dns_error` means the lookup broke; no hops and
/// no error means the name has no usable records.
#[derive(Debug, Clone, Serialize)]
pub struct ResolutionResult {
    pub hops: Vec<Hop>,
    pub srv_records: Vec<DnsSrvRecord>,
    pub a_records: Vec<DnsARecord>,
    pub kind: ResolutionKind,
    #[serde(skip)]
    pub dns_error: Option<DnsError>,
}

/// One-line-per-entry rendering of a [`ResolutionResult`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScrubbedResult {
    pub srv_records: Vec<String>,
    pub a_records: Vec<String>,
    pub hops: Vec<String>,
}

impl ResolutionResult {
    pub(crate) fn new(kind: ResolutionKind) -> Self {
        Self {
            hops: Vec::new(),
            srv_records: Vec::new(),
            a_records: Vec::new(),
            kind,
            dns_error: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// True when resolution was cut short by a DNS failure
    pub fn has_dns_error(&self) -> bool {
        self.dns_error.is_some()
    }

    /// Diagnostic projection, hops rendered as `host:port (TRANSPORT)`
    pub fn scrub(&self) -> ScrubbedResult {
        ScrubbedResult {
            srv_records: self.srv_records.iter().map(ToString::to_string).collect(),
            a_records: self.a_records.iter().map(ToString::to_string).collect(),
            hops: self.hops.iter().map(ToString::to_string).collect(),
        }
    }

    /// JSON dump for troubleshooting; the DNS error is not included
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
