//! # Policy Catalogue
//!
//! Three named registries of pluggable policies, each mapping a textual
//! policy name to a constructor:
//!
//! - **POA** (point of attachment): a transport binding. Pooled, so a
//!   fresh allocation never collides with a live one of the same kind.
//! - **Role**: transport-timing parameters held for reliability logic.
//! - **Routing**: per-application forwarding rules.
//!
//! Constructors are enumerated in a manifest built at compile time; the
//! flow registry consults it by name when creating and inspecting policy
//! records.

use std::collections::HashSet;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::defaults;
use crate::message::Address;

/// The transport implementation a POA policy variant activates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Udp,
}

/// A UDP point of attachment.
///
/// Pooled on the identity key `(addr, port)` over the registered
/// ephemeral port range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoaUdp {
    pub port: u16,
    pub addr: String,
}

impl PoaUdp {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            addr: defaults::LOOPBACK_ADDR.to_string(),
        }
    }

    /// The key no two live allocations of this kind may share.
    pub fn key(&self) -> (String, u16) {
        (self.addr.clone(), self.port)
    }

    /// Pick a binding that collides with none of the existing ones.
    ///
    /// The pool is every port in the registered range on the loopback
    /// address; the starting point is random so neighbouring processes
    /// spread out, with a linear probe past taken entries.
    pub fn allocate(existing: &[PoaUdp]) -> Option<PoaUdp> {
        let taken: HashSet<(String, u16)> = existing.iter().map(PoaUdp::key).collect();
        let pool_len = (defaults::POA_PORT_MAX - defaults::POA_PORT_MIN) as u32 + 1;
        let offset: u32 = rand::thread_rng().gen_range(0..pool_len);
        for step in 0..pool_len {
            let port =
                defaults::POA_PORT_MIN + ((offset + step) % pool_len) as u16;
            let candidate = PoaUdp::new(port);
            if !taken.contains(&candidate.key()) {
                return Some(candidate);
            }
        }
        None
    }
}

/// Transport-timing parameters for a receive or transmit role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RoleTiming {
    pub t_max_pdu: f64,
    pub t_max_ack: f64,
    pub t_max_rtx: f64,
}

impl Default for RoleTiming {
    fn default() -> Self {
        Self {
            t_max_pdu: 5.0,
            t_max_ack: 0.5,
            t_max_rtx: 11.0,
        }
    }
}

/// One forwarding rule, keyed by `(src, dst)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    pub src: Address,
    pub dst: Address,
    #[serde(rename = "hMax")]
    pub h_max: u32,
    pub via: Address,
}

/// An ordered forwarding table, aggregated to the application domain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingTable(pub Vec<Rule>);

impl RoutingTable {
    /// Replace, insert or remove the rule for `(src, dst)`.
    ///
    /// Returns the previous rule when one was present. With no
    /// replacement the existing rule is removed. A replacement whose own
    /// key does not equal `(src, dst)` changes nothing and returns
    /// nothing. Duplicate entries for one key are an anomaly worth a
    /// warning; only the first is touched.
    pub fn replace(&mut self, src: &Address, dst: &Address, rule: Option<Rule>) -> Option<Rule> {
        let mut matches = self
            .0
            .iter()
            .enumerate()
            .filter(|(_, r)| &r.src == src && &r.dst == dst)
            .map(|(n, _)| n);
        let index = matches.next();
        if matches.next().is_some() {
            warn!("duplicate rules for {}, {} in table", src, dst);
        }

        match (index, rule) {
            (Some(index), None) => Some(self.0.remove(index)),
            (Some(index), Some(rule)) => {
                if (&rule.src, &rule.dst) == (src, dst) {
                    Some(std::mem::replace(&mut self.0[index], rule))
                } else {
                    None
                }
            }
            (None, Some(rule)) => {
                if (&rule.src, &rule.dst) == (src, dst) {
                    self.0.push(rule);
                }
                None
            }
            (None, None) => None,
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Rule> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A policy value of any registered kind.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyValue {
    Udp(PoaUdp),
    Rx(RoleTiming),
    Tx(RoleTiming),
    Application(RoutingTable),
}

impl PolicyValue {
    pub fn as_udp(&self) -> Option<&PoaUdp> {
        match self {
            PolicyValue::Udp(poa) => Some(poa),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&RoutingTable> {
        match self {
            PolicyValue::Application(table) => Some(table),
            _ => None,
        }
    }
}

/// Which named registry a policy belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyRegistry {
    Poa,
    Role,
    Routing,
}

/// One manifest entry: a policy name bound to its constructors.
pub struct PolicySpec {
    pub name: &'static str,
    pub registry: PolicyRegistry,
    /// POA variants name the transport they activate.
    pub transport: Option<TransportKind>,
    pub pooled: bool,
    construct: fn() -> PolicyValue,
    allocate: Option<fn(&[PolicyValue]) -> Option<PolicyValue>>,
    decode: fn(&str) -> Result<PolicyValue, serde_json::Error>,
    encode: fn(&PolicyValue) -> Option<String>,
}

impl PolicySpec {
    /// Default-construct a value of this policy kind.
    pub fn construct(&self) -> PolicyValue {
        (self.construct)()
    }

    /// Allocate a fresh pooled value avoiding the existing ones.
    ///
    /// `None` when the kind is not pooled or the pool is exhausted.
    pub fn allocate(&self, existing: &[PolicyValue]) -> Option<PolicyValue> {
        self.allocate.and_then(|allocate| allocate(existing))
    }

    pub fn decode(&self, text: &str) -> Result<PolicyValue, serde_json::Error> {
        (self.decode)(text)
    }

    /// Canonical encoding; `None` when the value is of another kind.
    pub fn encode(&self, value: &PolicyValue) -> Option<String> {
        (self.encode)(value)
    }
}

fn allocate_udp(existing: &[PolicyValue]) -> Option<PolicyValue> {
    let live: Vec<PoaUdp> = existing
        .iter()
        .filter_map(|v| v.as_udp().cloned())
        .collect();
    PoaUdp::allocate(&live).map(PolicyValue::Udp)
}

/// Every policy the build knows about.
pub const MANIFEST: &[PolicySpec] = &[
    PolicySpec {
        name: "udp",
        registry: PolicyRegistry::Poa,
        transport: Some(TransportKind::Udp),
        pooled: true,
        construct: || PolicyValue::Udp(PoaUdp::new(defaults::POA_PORT_MIN)),
        allocate: Some(allocate_udp),
        decode: |text| serde_json::from_str::<PoaUdp>(text).map(PolicyValue::Udp),
        encode: |value| value.as_udp().and_then(|poa| serde_json::to_string(poa).ok()),
    },
    PolicySpec {
        name: "rx",
        registry: PolicyRegistry::Role,
        transport: None,
        pooled: false,
        construct: || PolicyValue::Rx(RoleTiming::default()),
        allocate: None,
        decode: |text| serde_json::from_str::<RoleTiming>(text).map(PolicyValue::Rx),
        encode: |value| match value {
            PolicyValue::Rx(role) => serde_json::to_string(role).ok(),
            _ => None,
        },
    },
    PolicySpec {
        name: "tx",
        registry: PolicyRegistry::Role,
        transport: None,
        pooled: false,
        construct: || PolicyValue::Tx(RoleTiming::default()),
        allocate: None,
        decode: |text| serde_json::from_str::<RoleTiming>(text).map(PolicyValue::Tx),
        encode: |value| match value {
            PolicyValue::Tx(role) => serde_json::to_string(role).ok(),
            _ => None,
        },
    },
    PolicySpec {
        name: "application",
        registry: PolicyRegistry::Routing,
        transport: None,
        pooled: false,
        construct: || PolicyValue::Application(RoutingTable::default()),
        allocate: None,
        decode: |text| serde_json::from_str::<RoutingTable>(text).map(PolicyValue::Application),
        encode: |value| value.as_table().and_then(|t| serde_json::to_string(t).ok()),
    },
];

/// Look a policy up by name.
pub fn lookup(name: &str) -> Option<&'static PolicySpec> {
    MANIFEST.iter().find(|spec| spec.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(application: &str) -> Address {
        Address::new("turberfield", "tundish", "test", application)
    }

    fn rule(src: &str, dst: &str, via: &str) -> Rule {
        Rule {
            src: address(src),
            dst: address(dst),
            h_max: 1,
            via: address(via),
        }
    }

    #[test]
    fn test_udp_allocation_avoids_collisions() {
        let existing: Vec<PoaUdp> = (defaults::POA_PORT_MIN..defaults::POA_PORT_MIN + 64)
            .map(PoaUdp::new)
            .collect();
        let fresh = PoaUdp::allocate(&existing).unwrap();
        assert!(!existing.iter().any(|poa| poa.key() == fresh.key()));
        assert!(fresh.port >= defaults::POA_PORT_MIN);
    }

    #[test]
    fn test_udp_allocation_exhausts() {
        let existing: Vec<PoaUdp> =
            (defaults::POA_PORT_MIN..=defaults::POA_PORT_MAX).map(PoaUdp::new).collect();
        assert_eq!(PoaUdp::allocate(&existing), None);
    }

    #[test]
    fn test_replace_inserts_new_rule() {
        let mut table = RoutingTable::default();
        let r = rule("sender", "receiver", "hub");
        assert_eq!(table.replace(&r.src, &r.dst, Some(r.clone())), None);
        assert_eq!(table.len(), 1);
        assert_eq!(table.0[0], r);
    }

    #[test]
    fn test_replace_swaps_existing_rule() {
        let mut table = RoutingTable::default();
        let first = rule("sender", "receiver", "hub");
        let second = rule("sender", "receiver", "relay");
        table.replace(&first.src, &first.dst, Some(first.clone()));

        let prev = table.replace(&second.src, &second.dst, Some(second.clone()));
        assert_eq!(prev, Some(first));
        assert_eq!(table.len(), 1);
        assert_eq!(table.0[0], second);
    }

    #[test]
    fn test_replace_removes_on_none() {
        let mut table = RoutingTable::default();
        let r = rule("sender", "receiver", "hub");
        table.replace(&r.src, &r.dst, Some(r.clone()));

        let prev = table.replace(&r.src, &r.dst, None);
        assert_eq!(prev, Some(r));
        assert!(table.is_empty());
    }

    #[test]
    fn test_replace_rejects_mismatched_key() {
        let mut table = RoutingTable::default();
        let r = rule("sender", "receiver", "hub");
        table.replace(&r.src, &r.dst, Some(r.clone()));

        // A rule keyed elsewhere must not land under this key.
        let stray = rule("other", "receiver", "hub");
        let prev = table.replace(&r.src, &r.dst, Some(stray));
        assert_eq!(prev, None);
        assert_eq!(table.0[0], r);
    }

    #[test]
    fn test_table_round_trips_through_manifest_codec() {
        let spec = lookup("application").unwrap();
        let mut table = RoutingTable::default();
        let a = rule("sender", "receiver", "hub");
        let b = rule("receiver", "sender", "hub");
        table.replace(&a.src, &a.dst, Some(a.clone()));
        table.replace(&b.src, &b.dst, Some(b.clone()));

        let value = PolicyValue::Application(table.clone());
        let text = spec.encode(&value).unwrap();
        let decoded = spec.decode(&text).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_lookup_unknown_policy() {
        assert!(lookup("ftp").is_none());
    }
}
