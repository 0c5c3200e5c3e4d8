use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::TokioAsyncResolver;
use tracing::{debug, trace};

use super::{DnsLookup, DnsResult, A, NAPTR, SRV};
use crate::error::DnsError;

/// [`DnsLookup`] backed by hickory's async resolver
///
/// Answers are cached by hickory according to their TTLs.
pub struct HickoryDnsLookup {
    resolver: TokioAsyncResolver,
    timeout: Duration,
}

impl HickoryDnsLookup {
    /// Use the system resolver configuration (`/etc/resolv.conf` on unix)
    pub fn from_system_conf(timeout: Duration) -> DnsResult<Self> {
        let (config, mut opts) = hickory_resolver::system_conf::read_system_conf()
            .map_err(|e| DnsError::Unavailable(e.to_string()))?;
        opts.timeout = timeout;
        Ok(Self::with_config(config, opts, timeout))
    }

    /// Use an explicit resolver configuration
    pub fn with_config(config: ResolverConfig, opts: ResolverOpts, timeout: Duration) -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
            timeout,
        }
    }

    async fn run<T, F>(&self, name: &str, record_type: &'static str, query: F) -> DnsResult<Option<T>>
    where
        F: Future<Output = Result<T, ResolveError>>,
    {
        match tokio::time::timeout(self.timeout, query).await {
            Err(_) => Err(DnsError::timeout(name, record_type)),
            Ok(Ok(answer)) => Ok(Some(answer)),
            Ok(Err(e)) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => {
                    trace!("No {} records for {}", record_type, name);
                    Ok(None)
                }
                ResolveErrorKind::Timeout => Err(DnsError::timeout(name, record_type)),
                _ => {
                    debug!("{} lookup for {} failed: {}", record_type, name, e);
                    Err(DnsError::failed(name, record_type, e.to_string()))
                }
            },
        }
    }
}

#[async_trait]
impl DnsLookup for HickoryDnsLookup {
    async fn lookup_naptr(&self, name: &str) -> DnsResult<Vec<String>> {
        let Some(lookup) = self.run(name, NAPTR, self.resolver.lookup(name, RecordType::NAPTR)).await? else {
            return Ok(Vec::new());
        };
        let records = lookup
            .iter()
            .filter_map(|rdata| match rdata {
                RData::NAPTR(naptr) => Some(format!(
                    "{} {} \"{}\" \"{}\" \"{}\" {}",
                    naptr.order(),
                    naptr.preference(),
                    String::from_utf8_lossy(naptr.flags()),
                    String::from_utf8_lossy(naptr.services()),
                    String::from_utf8_lossy(naptr.regexp()),
                    naptr.replacement()
                )),
                _ => None,
            })
            .collect();
        Ok(records)
    }

    async fn lookup_srv(&self, name: &str) -> DnsResult<Vec<String>> {
        let Some(lookup) = self.run(name, SRV, self.resolver.srv_lookup(name)).await? else {
            return Ok(Vec::new());
        };
        Ok(lookup
            .iter()
            .map(|srv| format!("{} {} {} {}", srv.priority(), srv.weight(), srv.port(), srv.target()))
            .collect())
    }

    async fn lookup_a(&self, name: &str) -> DnsResult<Vec<IpAddr>> {
        let Some(lookup) = self.run(name, A, self.resolver.lookup_ip(name)).await? else {
            return Ok(Vec::new());
        };
        Ok(lookup.iter().collect())
    }
}
