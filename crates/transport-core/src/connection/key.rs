use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::Serialize;

use crate::transport::Transport;

/// Identity of a connection: local and remote endpoints plus transport
///
/// The local side may be left unspecified, in which case [`matches`] treats
/// it as a wildcard. `Hash`/`Eq` stay exact so the key can index a map.
///
/// [`matches`]: ConnectionKey::matches
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionKey {
    pub local_addr: Option<IpAddr>,
    pub local_port: Option<u16>,
    pub remote: SocketAddr,
    pub transport: Transport,
}

impl ConnectionKey {
    /// Build a key; unspecified addresses and port 0 become wildcards
    pub fn new(local_addr: Option<IpAddr>, local_port: Option<u16>, remote: SocketAddr, transport: Transport) -> Self {
        Self {
            local_addr: local_addr.filter(|a| !a.is_unspecified()),
            local_port: local_port.filter(|&p| p != 0),
            remote,
            transport,
        }
    }

    /// Key for an established socket pair
    pub fn from_binding(binding: &BindingInfo) -> Self {
        Self::new(
            Some(binding.local.ip()),
            Some(binding.local.port()),
            binding.remote,
            binding.transport,
        )
    }

    /// Equality with an unspecified local address or port on either side matching anything
    pub fn matches(&self, other: &ConnectionKey) -> bool {
        fn loose<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
        }
        self.remote == other.remote
            && self.transport == other.transport
            && loose(&self.local_addr, &other.local_addr)
            && loose(&self.local_port, &other.local_port)
    }

    /// The local endpoint to bind, if any part of it is pinned
    pub fn local_bind_addr(&self) -> Option<SocketAddr> {
        match (self.local_addr, self.local_port) {
            (None, None) => None,
            (addr, port) => {
                let ip = addr.unwrap_or_else(|| unspecified_like(&self.remote));
                Some(SocketAddr::new(ip, port.unwrap_or(0)))
            }
        }
    }
}

/// The unspecified address of the same family as `addr`
pub(crate) fn unspecified_like(addr: &SocketAddr) -> IpAddr {
    match addr {
        SocketAddr::V4(_) => IpAddr::from([0u8; 4]),
        SocketAddr::V6(_) => IpAddr::from([0u16; 8]),
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let local = match (self.local_addr, self.local_port) {
            (Some(addr), Some(port)) => SocketAddr::new(addr, port).to_string(),
            (Some(addr), None) => format!("{}:*", addr),
            (None, Some(port)) => format!("*:{}", port),
            (None, None) => "*".to_string(),
        };
        write!(f, "{} -> {} ({})", local, self.remote, self.transport)
    }
}

/// Socket pair and network a message arrived on or leaves from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindingInfo {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub transport: Transport,
    pub network: String,
}

impl BindingInfo {
    pub fn new(local: SocketAddr, remote: SocketAddr, transport: Transport, network: impl Into<String>) -> Self {
        Self {
            local,
            remote,
            transport,
            network: network.into(),
        }
    }
}

impl fmt::Display for BindingInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {} ({}, {})", self.local, self.remote, self.transport, self.network)
    }
}
