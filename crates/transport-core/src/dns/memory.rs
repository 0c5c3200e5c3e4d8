use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::trace;

use super::{normalize_name, DnsLookup, DnsResult, A, NAPTR, SRV};
use crate::error::DnsError;

#[derive(Default)]
struct Tables {
    naptr: HashMap<String, Vec<String>>,
    srv: HashMap<String, Vec<String>>,
    a: HashMap<String, Vec<IpAddr>>,
    failures: HashMap<(String, &'static str), DnsError>,
}

/// In-memory DNS answers
///
/// Used for static deployments and tests. Names are matched
/// case-insensitively with the trailing dot ignored. A failure registered
/// with [`fail`](Self::fail) takes precedence over stored answers.
#[derive(Default)]
pub struct StaticDnsLookup {
    tables: RwLock<Tables>,
    naptr_calls: AtomicUsize,
    srv_calls: AtomicUsize,
    a_calls: AtomicUsize,
}

impl StaticDnsLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_naptr(&self, name: &str, record: impl Into<String>) -> &Self {
        self.tables
            .write()
            .naptr
            .entry(normalize_name(name))
            .or_default()
            .push(record.into());
        self
    }

    pub fn add_srv(&self, name: &str, record: impl Into<String>) -> &Self {
        self.tables
            .write()
            .srv
            .entry(normalize_name(name))
            .or_default()
            .push(record.into());
        self
    }

    pub fn add_a(&self, name: &str, address: IpAddr) -> &Self {
        self.tables
            .write()
            .a
            .entry(normalize_name(name))
            .or_default()
            .push(address);
        self
    }

    /// Make lookups of `record_type` ("NAPTR", "SRV" or "A") for `name` fail
    pub fn fail(&self, name: &str, record_type: &'static str, error: DnsError) -> &Self {
        self.tables
            .write()
            .failures
            .insert((normalize_name(name), record_type), error);
        self
    }

    pub fn clear(&self) {
        *self.tables.write() = Tables::default();
    }

    pub fn naptr_calls(&self) -> usize {
        self.naptr_calls.load(Ordering::Relaxed)
    }

    pub fn srv_calls(&self) -> usize {
        self.srv_calls.load(Ordering::Relaxed)
    }

    pub fn a_calls(&self) -> usize {
        self.a_calls.load(Ordering::Relaxed)
    }

    /// Total lookups of any type served so far
    pub fn total_calls(&self) -> usize {
        self.naptr_calls() + self.srv_calls() + self.a_calls()
    }

    fn answer<T: Clone>(
        &self,
        name: &str,
        record_type: &'static str,
        select: impl FnOnce(&Tables) -> Option<&Vec<T>>,
    ) -> DnsResult<Vec<T>> {
        let key = normalize_name(name);
        let tables = self.tables.read();
        if let Some(error) = tables.failures.get(&(key.clone(), record_type)) {
            return Err(error.clone());
        }
        let answers = select(&tables).cloned().unwrap_or_default();
        trace!("Static {} lookup for {} returned {} answers", record_type, key, answers.len());
        Ok(answers)
    }
}

#[async_trait]
impl DnsLookup for StaticDnsLookup {
    async fn lookup_naptr(&self, name: &str) -> DnsResult<Vec<String>> {
        self.naptr_calls.fetch_add(1, Ordering::Relaxed);
        let key = normalize_name(name);
        self.answer(name, NAPTR, |t| t.naptr.get(&key))
    }

    async fn lookup_srv(&self, name: &str) -> DnsResult<Vec<String>> {
        self.srv_calls.fetch_add(1, Ordering::Relaxed);
        let key = normalize_name(name);
        self.answer(name, SRV, |t| t.srv.get(&key))
    }

    async fn lookup_a(&self, name: &str) -> DnsResult<Vec<IpAddr>> {
        self.a_calls.fetch_add(1, Ordering::Relaxed);
        let key = normalize_name(name);
        self.answer(name, A, |t| t.a.get(&key))
    }
}
