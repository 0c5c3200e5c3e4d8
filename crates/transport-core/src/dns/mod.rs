//! DNS collaborators
//!
//! The resolver never talks to the network directly. It asks a [`DnsLookup`]
//! for record text in the formats [`locator::records`](crate::locator::records)
//! parses, and overlays answers from an optional [`DnsInjectionService`].
//!
//! A name with no records is an empty answer, not an error. Errors are
//! reserved for lookups that broke (timeouts, SERVFAIL, no resolver).

use std::net::IpAddr;

use async_trait::async_trait;

use crate::error::DnsError;

#[cfg(feature = "dns")]
mod hickory;
mod injection;
mod memory;

#[cfg(feature = "dns")]
pub use hickory::HickoryDnsLookup;
pub use injection::{DnsInjectionService, InjectAction, InjectedARecord, InjectedSrvRecord};
pub use memory::StaticDnsLookup;

/// Result type for DNS lookups
pub type DnsResult<T> = std::result::Result<T, DnsError>;

pub const NAPTR: &str = "NAPTR";
pub const SRV: &str = "SRV";
pub const A: &str = "A";

/// Source of raw DNS answers
///
/// Implementations apply their own timeout and report it as
/// [`DnsError::Timeout`].
#[async_trait]
pub trait DnsLookup: Send + Sync {
    /// NAPTR answers as `order preference "flags" "service" "regexp" replacement`
    async fn lookup_naptr(&self, name: &str) -> DnsResult<Vec<String>>;

    /// SRV answers as `priority weight port target`
    async fn lookup_srv(&self, name: &str) -> DnsResult<Vec<String>>;

    /// A and AAAA answers
    async fn lookup_a(&self, name: &str) -> DnsResult<Vec<IpAddr>>;
}

/// Lowercase and drop the root dot so names compare equal however they were written
pub(crate) fn normalize_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}
