//! Operator-driven DNS overrides
//!
//! Records are injected for one user id or globally. Lookups for an id that
//! has no overrides of the requested type fall back to the global set. Each
//! injected record names the query it answers and how it combines with the
//! real answers for that query.

use std::net::IpAddr;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::normalize_name;

/// How injected answers combine with real DNS answers for the same name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InjectAction {
    /// Ignore real answers
    Replace,
    /// Put injected answers ahead of real ones
    Prepend,
}

/// An injected SRV answer for the query `name`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectedSrvRecord {
    pub name: String,
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: String,
    pub action: InjectAction,
}

impl InjectedSrvRecord {
    pub fn new(name: &str, priority: u16, weight: u16, port: u16, target: &str, action: InjectAction) -> Self {
        Self {
            name: normalize_name(name),
            priority,
            weight,
            port,
            target: normalize_name(target),
            action,
        }
    }
}

/// An injected A answer for `name`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectedARecord {
    pub name: String,
    pub address: IpAddr,
    pub action: InjectAction,
}

impl InjectedARecord {
    pub fn new(name: &str, address: IpAddr, action: InjectAction) -> Self {
        Self {
            name: normalize_name(name),
            address,
            action,
        }
    }
}

/// Which overrides a record set belongs to; `None` is the global set
type Scope = Option<String>;

/// In-memory store of injected records keyed by user id
#[derive(Debug, Default)]
pub struct DnsInjectionService {
    srv: DashMap<Scope, Vec<InjectedSrvRecord>>,
    a: DashMap<Scope, Vec<InjectedARecord>>,
}

fn scope_key(user_id: Option<&str>) -> Scope {
    user_id
        .filter(|id| !id.is_empty())
        .map(|id| id.to_ascii_lowercase())
}

fn scope_name(user_id: Option<&str>) -> &str {
    user_id.filter(|id| !id.is_empty()).unwrap_or("all users")
}

impl DnsInjectionService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the SRV overrides for `user_id` (global when `None`)
    pub fn inject_srv(&self, user_id: Option<&str>, records: Vec<InjectedSrvRecord>) {
        warn!("Injecting {} SRV records for {}", records.len(), scope_name(user_id));
        let records = records
            .into_iter()
            .map(|r| InjectedSrvRecord {
                name: normalize_name(&r.name),
                target: normalize_name(&r.target),
                ..r
            })
            .collect();
        self.srv.insert(scope_key(user_id), records);
    }

    /// Replace the A overrides for `user_id` (global when `None`)
    pub fn inject_a(&self, user_id: Option<&str>, records: Vec<InjectedARecord>) {
        warn!("Injecting {} A records for {}", records.len(), scope_name(user_id));
        let records = records
            .into_iter()
            .map(|r| InjectedARecord {
                name: normalize_name(&r.name),
                ..r
            })
            .collect();
        self.a.insert(scope_key(user_id), records);
    }

    /// Drop every override for `user_id`
    pub fn clear(&self, user_id: Option<&str>) {
        let key = scope_key(user_id);
        self.srv.remove(&key);
        self.a.remove(&key);
    }

    /// SRV overrides in effect for `user_id`
    pub fn injected_srv(&self, user_id: Option<&str>) -> Vec<InjectedSrvRecord> {
        if let Some(records) = self.srv.get(&scope_key(user_id)) {
            if !records.is_empty() {
                return records.clone();
            }
        }
        match scope_key(user_id) {
            Some(_) => self.injected_srv(None),
            None => Vec::new(),
        }
    }

    /// A overrides in effect for `user_id`
    pub fn injected_a(&self, user_id: Option<&str>) -> Vec<InjectedARecord> {
        if let Some(records) = self.a.get(&scope_key(user_id)) {
            if !records.is_empty() {
                return records.clone();
            }
        }
        match scope_key(user_id) {
            Some(_) => self.injected_a(None),
            None => Vec::new(),
        }
    }

    /// SRV overrides answering the query `name`
    pub(crate) fn srv_for(&self, user_id: Option<&str>, name: &str) -> Vec<InjectedSrvRecord> {
        let name = normalize_name(name);
        self.injected_srv(user_id)
            .into_iter()
            .filter(|r| r.name == name)
            .collect()
    }

    /// A overrides answering the query `name`
    pub(crate) fn a_for(&self, user_id: Option<&str>, name: &str) -> Vec<InjectedARecord> {
        let name = normalize_name(name);
        self.injected_a(user_id)
            .into_iter()
            .filter(|r| r.name == name)
            .collect()
    }
}
