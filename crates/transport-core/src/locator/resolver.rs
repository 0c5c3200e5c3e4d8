//! Destination resolution
//!
//! ```text
//! literal IP ──────────────────────────────► 1 hop            (IP)
//! transport + port ───────► A ────────────► hop per address  (HOSTNAME)
//! otherwise ──► NAPTR ──► SRV per record ─► select ─► A      (SRV)
//!                 │ none usable
//!                 └──► _sips._tcp/_sip._tcp/_sip._udp ─► select ─► A   (SRV)
//!                        │ no hops
//!                        └──► A on the name, default port    (HOSTNAME)
//! ```
//!
//! A DNS error stops resolution. It is stored on the result next to whatever
//! hops were gathered before it.

use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use super::destination::SipDestination;
use super::records::{DnsARecord, DnsSrvRecord, NaptrRecord, RecordSource, SrvCandidate};
use super::result::{Hop, ResolutionKind, ResolutionResult};
use super::selector::order_candidates;
use crate::dns::{DnsInjectionService, DnsLookup, DnsResult, InjectAction};
use crate::transport::{Transport, TransportLookupType};

/// Turns a [`SipDestination`] into an ordered list of hops
pub struct DestinationResolver {
    dns: Arc<dyn DnsLookup>,
    injection: Option<Arc<DnsInjectionService>>,
    rng: Mutex<StdRng>,
}

impl DestinationResolver {
    pub fn new(dns: Arc<dyn DnsLookup>) -> Self {
        Self {
            dns,
            injection: None,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Overlay injected records on DNS answers
    pub fn with_injection(mut self, injection: Arc<DnsInjectionService>) -> Self {
        self.injection = Some(injection);
        self
    }

    /// Seed the weighted selection, for reproducible hop orders
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn injection(&self) -> Option<&Arc<DnsInjectionService>> {
        self.injection.as_ref()
    }

    /// Resolve `destination`; never fails, see [`ResolutionResult`]
    pub async fn resolve(&self, destination: &SipDestination) -> ResolutionResult {
        if let Some(ip) = destination.ip_addr() {
            return Self::resolve_ip(destination, ip);
        }

        let mut result = ResolutionResult::new(ResolutionKind::Unknown);
        let outcome = if destination.is_direct_hostname() {
            let transport = destination.inferred_transport();
            let port = destination.port().unwrap_or_else(|| transport.default_port());
            result.kind = ResolutionKind::Hostname;
            self.resolve_hostname(destination, port, transport, &mut result).await
        } else {
            self.search(destination, &mut result).await
        };

        if let Err(e) = outcome {
            warn!("Resolution of {} stopped after {} hops: {}", destination, result.hops.len(), e);
            result.dns_error = Some(e);
        }

        info!(
            "Resolved {} to {} hops ({:?})",
            destination,
            result.hops.len(),
            result.kind
        );
        result
    }

    fn resolve_ip(destination: &SipDestination, ip: IpAddr) -> ResolutionResult {
        let transport = destination.inferred_transport();
        let port = destination.port().unwrap_or_else(|| transport.default_port());
        let mut result = ResolutionResult::new(ResolutionKind::Ip);
        result.hops.push(Hop::new(ip, port, transport));
        debug!("{} is a literal address, no lookups", destination);
        result
    }

    async fn search(&self, destination: &SipDestination, result: &mut ResolutionResult) -> DnsResult<()> {
        let name = destination.address();
        let lookup_type = destination.transport_lookup_type();

        let naptr = self.naptr_records(name, lookup_type).await?;
        if !naptr.is_empty() {
            result.kind = ResolutionKind::Srv;
            for record in &naptr {
                let mut candidates = self
                    .srv_candidates(destination, &record.replacement, record.transport(), result)
                    .await?;
                let ordered = self.select(&mut candidates);
                self.expand(destination, &ordered, result).await?;
            }
            if !result.hops.is_empty() {
                return Ok(());
            }
            debug!("NAPTR records for {} led to no hops, trying SRV directly", name);
        }

        let mut candidates = Vec::new();
        for transport in lookup_type.srv_transports() {
            let Some(prefix) = transport.srv_prefix() else {
                continue;
            };
            let srv_name = format!("{}{}", prefix, name);
            let found = self.srv_candidates(destination, &srv_name, transport, result).await?;
            if found.is_empty() {
                continue;
            }
            candidates.extend(found);
            if lookup_type != TransportLookupType::Any {
                break;
            }
        }
        if !candidates.is_empty() {
            result.kind = ResolutionKind::Srv;
            let ordered = self.select(&mut candidates);
            self.expand(destination, &ordered, result).await?;
            if !result.hops.is_empty() {
                return Ok(());
            }
        }

        let transport = match lookup_type {
            TransportLookupType::Any => Transport::Udp,
            TransportLookupType::TlsAndTcp => Transport::Tls,
            other => other.specific().unwrap_or(Transport::Udp),
        };
        let port = destination.port().unwrap_or_else(|| transport.default_port());
        debug!("No SRV data for {}, falling back to hostname on port {}", name, port);
        result.kind = ResolutionKind::Hostname;
        self.resolve_hostname(destination, port, transport, result).await
    }

    /// Usable NAPTR records sorted by order, then preference
    async fn naptr_records(&self, name: &str, lookup_type: TransportLookupType) -> DnsResult<Vec<NaptrRecord>> {
        let raw = self.dns.lookup_naptr(name).await?;
        let mut records: Vec<NaptrRecord> = raw
            .iter()
            .filter_map(|text| NaptrRecord::parse(text))
            .filter(|record| lookup_type.accepts(record.transport()))
            .collect();
        records.sort_by_key(|record| (record.order, record.preference));
        debug!("{} of {} NAPTR records for {} are usable", records.len(), raw.len(), name);
        Ok(records)
    }

    /// SRV answers for `srv_name`, injected ones first, recorded on `result`
    async fn srv_candidates(
        &self,
        destination: &SipDestination,
        srv_name: &str,
        transport: Transport,
        result: &mut ResolutionResult,
    ) -> DnsResult<Vec<SrvCandidate>> {
        let mut records: Vec<DnsSrvRecord> = Vec::new();
        let mut replace = false;
        if let Some(injection) = &self.injection {
            for injected in injection.srv_for(destination.id(), srv_name) {
                replace |= injected.action == InjectAction::Replace;
                records.push(DnsSrvRecord {
                    name: injected.name,
                    priority: injected.priority,
                    weight: injected.weight,
                    port: injected.port,
                    target: injected.target,
                    source: RecordSource::Injected,
                });
            }
        }

        if !replace {
            let answers = self.dns.lookup_srv(srv_name).await?;
            records.extend(answers.iter().filter_map(|text| DnsSrvRecord::parse(srv_name, text)));
        }

        debug!("{} SRV records for {}", records.len(), srv_name);
        let candidates = records
            .iter()
            .map(|record| SrvCandidate::from_record(record, transport))
            .collect();
        result.srv_records.extend(records);
        Ok(candidates)
    }

    fn select(&self, candidates: &mut [SrvCandidate]) -> Vec<SrvCandidate> {
        let mut rng = self.rng.lock();
        order_candidates(candidates, &mut *rng)
    }

    /// Addresses for `host`, injected ones first, recorded on `result`
    async fn addresses(
        &self,
        destination: &SipDestination,
        host: &str,
        result: &mut ResolutionResult,
    ) -> DnsResult<Vec<(IpAddr, RecordSource)>> {
        let mut addresses = Vec::new();
        let mut replace = false;
        if let Some(injection) = &self.injection {
            for injected in injection.a_for(destination.id(), host) {
                replace |= injected.action == InjectAction::Replace;
                addresses.push((injected.address, RecordSource::Injected));
            }
        }

        if !replace {
            for address in self.dns.lookup_a(host).await? {
                addresses.push((address, RecordSource::Dns));
            }
        }

        result.a_records.extend(addresses.iter().map(|&(address, source)| DnsARecord {
            name: host.to_string(),
            address,
            source,
        }));
        Ok(addresses)
    }

    /// One hop per address of every selected candidate, in selection order
    async fn expand(
        &self,
        destination: &SipDestination,
        ordered: &[SrvCandidate],
        result: &mut ResolutionResult,
    ) -> DnsResult<()> {
        for candidate in ordered {
            let addresses = self.addresses(destination, &candidate.host, result).await?;
            if addresses.is_empty() {
                debug!("SRV target {} has no addresses", candidate.host);
            }
            for (address, source) in addresses {
                let source = match candidate.source {
                    RecordSource::Injected => RecordSource::Injected,
                    RecordSource::Dns => source,
                };
                result.hops.push(Hop {
                    hostname: Some(candidate.host.clone()),
                    host: address,
                    port: candidate.port,
                    transport: candidate.transport,
                    priority: candidate.priority,
                    source,
                });
            }
        }
        Ok(())
    }

    async fn resolve_hostname(
        &self,
        destination: &SipDestination,
        port: u16,
        transport: Transport,
        result: &mut ResolutionResult,
    ) -> DnsResult<()> {
        let name = destination.address();
        for (address, source) in self.addresses(destination, name, result).await? {
            result.hops.push(Hop {
                hostname: Some(name.to_string()),
                host: address,
                port,
                transport,
                priority: 0,
                source,
            });
        }
        Ok(())
    }
}
