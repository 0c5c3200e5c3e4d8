//! NAPTR and SRV record parsing
//!
//! The DNS collaborator hands records over as text. A record that cannot be
//! parsed yields `None` and is dropped from the candidate set; it never
//! aborts a resolution.
//!
//! Formats, space separated:
//!
//! ```text
//! NAPTR: order preference "flags" "service" "regexp" replacement
//! SRV:   priority weight port target
//! ```

use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::transport::Transport;

pub const SIP_UDP: &str = "SIP+D2U";
pub const SIP_TCP: &str = "SIP+D2T";
pub const SIPS_TCP: &str = "SIPS+D2T";
pub const SIP_SCTP: &str = "SIP+D2S";

/// Strip surrounding double quotes and whitespace
///
/// Quote pairs are peeled until none remain, so `unquote(unquote(s)) ==
/// unquote(s)` holds for every input.
pub fn unquote(value: &str) -> &str {
    let mut value = value.trim();
    while value.len() > 1 && value.starts_with('"') && value.ends_with('"') {
        value = value[1..value.len() - 1].trim();
    }
    value
}

/// Map a NAPTR service field to a transport, case-insensitively
pub fn service_type(service: &str) -> Transport {
    if service.eq_ignore_ascii_case(SIP_UDP) {
        Transport::Udp
    } else if service.eq_ignore_ascii_case(SIP_TCP) {
        Transport::Tcp
    } else if service.eq_ignore_ascii_case(SIPS_TCP) {
        Transport::Tls
    } else if service.eq_ignore_ascii_case(SIP_SCTP) {
        Transport::Sctp
    } else {
        Transport::None
    }
}

/// Where a record or hop came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordSource {
    Dns,
    Injected,
}

impl fmt::Display for RecordSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordSource::Dns => f.write_str("DNS"),
            RecordSource::Injected => f.write_str("INJECTED"),
        }
    }
}

fn trim_root(name: &str) -> &str {
    name.strip_suffix('.').unwrap_or(name)
}

/// A parsed NAPTR record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NaptrRecord {
    pub order: u16,
    pub preference: u16,
    pub flags: String,
    pub service: String,
    pub regexp: String,
    /// SRV query name to follow
    pub replacement: String,
}

impl NaptrRecord {
    /// Parse one record, returning `None` on any malformed input
    pub fn parse(record: &str) -> Option<Self> {
        let tokens: Vec<&str> = record.split_whitespace().collect();
        if tokens.len() != 6 {
            debug!("Dropping NAPTR record with {} tokens: {}", tokens.len(), record);
            return None;
        }

        let order = tokens[0].parse().ok();
        let preference = tokens[1].parse().ok();
        let (Some(order), Some(preference)) = (order, preference) else {
            debug!("Dropping NAPTR record with non-numeric order/preference: {}", record);
            return None;
        };

        let replacement = trim_root(unquote(tokens[5]));
        if replacement.is_empty() {
            debug!("Dropping NAPTR record without replacement: {}", record);
            return None;
        }

        let parsed = NaptrRecord {
            order,
            preference,
            flags: unquote(tokens[2]).to_string(),
            service: unquote(tokens[3]).to_string(),
            regexp: unquote(tokens[4]).to_string(),
            replacement: replacement.to_string(),
        };
        debug!("Parsed NAPTR record {}", parsed);
        Some(parsed)
    }

    /// Transport named by the service field
    pub fn transport(&self) -> Transport {
        service_type(&self.service)
    }
}

impl fmt::Display for NaptrRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.order, self.preference, self.flags, self.service, self.replacement
        )
    }
}

/// A typed SRV answer, kept on the resolution result for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DnsSrvRecord {
    /// The SRV query name this answer belongs to
    pub name: String,
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: String,
    pub source: RecordSource,
}

impl DnsSrvRecord {
    /// Parse one SRV answer for query `name`
    pub fn parse(name: &str, record: &str) -> Option<Self> {
        let tokens: Vec<&str> = record.split_whitespace().collect();
        if tokens.len() != 4 {
            debug!("Dropping SRV record with {} tokens: {}", tokens.len(), record);
            return None;
        }
        let (Ok(priority), Ok(weight), Ok(port)) =
            (tokens[0].parse(), tokens[1].parse(), tokens[2].parse())
        else {
            debug!("Dropping SRV record with non-numeric fields: {}", record);
            return None;
        };
        let target = trim_root(unquote(tokens[3]));
        if target.is_empty() {
            debug!("Dropping SRV record without target: {}", record);
            return None;
        }
        Some(DnsSrvRecord {
            name: trim_root(name).to_string(),
            priority,
            weight,
            port,
            target: target.to_string(),
            source: RecordSource::Dns,
        })
    }

    /// Mark the record as coming from `source`
    pub fn with_source(mut self, source: RecordSource) -> Self {
        self.source = source;
        self
    }
}

impl fmt::Display for DnsSrvRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} SRV {} {} {} {} ({})",
            self.name, self.priority, self.weight, self.port, self.target, self.source
        )
    }
}

/// A typed A/AAAA answer, kept for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DnsARecord {
    pub name: String,
    pub address: std::net::IpAddr,
    pub source: RecordSource,
}

impl fmt::Display for DnsARecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} A {} ({})", self.name, self.address, self.source)
    }
}

/// One SRV target taking part in weighted selection
///
/// `enabled` and `running_sum` are scratch state for a single resolution
/// attempt. Candidates are built fresh from records for every attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvCandidate {
    pub priority: u16,
    pub weight: u16,
    pub host: String,
    pub port: u16,
    pub transport: Transport,
    pub source: RecordSource,
    pub enabled: bool,
    pub running_sum: u32,
}

impl SrvCandidate {
    pub fn new(priority: u16, weight: u16, host: impl Into<String>, port: u16, transport: Transport) -> Self {
        Self {
            priority,
            weight,
            host: host.into(),
            port,
            transport,
            source: RecordSource::Dns,
            enabled: true,
            running_sum: 0,
        }
    }

    /// Parse an SRV answer text directly into a candidate
    pub fn parse(record: &str, transport: Transport) -> Option<Self> {
        DnsSrvRecord::parse("", record).map(|r| Self::from_record(&r, transport))
    }

    pub fn from_record(record: &DnsSrvRecord, transport: Transport) -> Self {
        let mut candidate = Self::new(record.priority, record.weight, record.target.clone(), record.port, transport);
        candidate.source = record.source;
        candidate
    }
}
