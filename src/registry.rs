//! Device registry and merge engine.
//!
//! One poll cycle produces several partial views of the network: who is
//! associated to a radio, who answers ARP, who holds a DHCP lease. The
//! [`MergeEngine`] folds them into one [`Registry`] keyed by MAC address and
//! diffs it against the previous cycle.
//!
//! Fields are merged one by one. For `ip` and `hostname` the lease file is
//! most authoritative, then the web UI, ARP, the neighbor table and finally
//! association dumps. For `interface` the order is reversed for the shell
//! sources: association dumps name the radio, while ARP and neighbor rows
//! only name the bridge.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::mac::MacAddress;
use crate::parse::PartialTable;

/// Where a record came from.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Wireless,
    Arp,
    Neighbor,
    Lease,
    Http,
}

impl Source {
    /// Precedence for address and name fields; higher wins.
    pub fn precedence(self) -> u8 {
        match self {
            Source::Lease => 4,
            Source::Http => 3,
            Source::Arp => 2,
            Source::Neighbor => 1,
            Source::Wireless => 0,
        }
    }

    /// Precedence for the `interface` field; higher wins.
    pub fn interface_precedence(self) -> u8 {
        match self {
            Source::Wireless => 4,
            Source::Http => 3,
            Source::Arp => 2,
            Source::Neighbor => 1,
            Source::Lease => 0,
        }
    }
}

/// Best current knowledge about one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeviceRecord {
    #[schemars(with = "String")]
    pub mac: MacAddress,
    pub ip: Option<IpAddr>,
    pub hostname: Option<String>,
    pub interface: Option<String>,
    /// Highest-precedence source that reported this device.
    pub source: Source,
    /// Every source that reported this device in the cycle.
    pub sources: BTreeSet<Source>,
    pub lease_expires: Option<DateTime<Utc>>,
    pub last_seen: DateTime<Utc>,
}

/// Mapping from MAC address to device record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Registry {
    devices: BTreeMap<MacAddress, DeviceRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, mac: &MacAddress) -> Option<&DeviceRecord> {
        self.devices.get(mac)
    }

    pub fn contains(&self, mac: &MacAddress) -> bool {
        self.devices.contains_key(mac)
    }

    pub fn macs(&self) -> BTreeSet<MacAddress> {
        self.devices.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MacAddress, &DeviceRecord)> {
        self.devices.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.values()
    }

    /// Registry contents as a plain map.
    pub fn into_map(self) -> BTreeMap<MacAddress, DeviceRecord> {
        self.devices
    }
}

impl<'a> IntoIterator for &'a Registry {
    type Item = (&'a MacAddress, &'a DeviceRecord);
    type IntoIter = std::collections::btree_map::Iter<'a, MacAddress, DeviceRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.devices.iter()
    }
}

/// Presence changes between two consecutive cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryDiff {
    pub newly_connected: BTreeSet<MacAddress>,
    pub still_connected: BTreeSet<MacAddress>,
    pub disconnected: BTreeSet<MacAddress>,
}

impl RegistryDiff {
    pub fn between(previous: &Registry, current: &Registry) -> Self {
        let before = previous.macs();
        let after = current.macs();
        Self {
            newly_connected: after.difference(&before).copied().collect(),
            still_connected: after.intersection(&before).copied().collect(),
            disconnected: before.difference(&after).copied().collect(),
        }
    }

    /// True when no device appeared or vanished.
    pub fn is_unchanged(&self) -> bool {
        self.newly_connected.is_empty() && self.disconnected.is_empty()
    }
}

/// Partial records contributed by one source in one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contribution {
    pub source: Source,
    pub table: PartialTable,
}

impl Contribution {
    pub fn new(source: Source, table: PartialTable) -> Self {
        Self { source, table }
    }
}

/// Folds contributions into a registry. Pure and order independent.
pub fn merge(contributions: &[Contribution], observed_at: DateTime<Utc>) -> Registry {
    // Apply lowest precedence first so higher sources overwrite per field.
    let mut by_value: Vec<&Contribution> = contributions.iter().collect();
    by_value.sort_by_key(|c| (c.source.precedence(), c.source));
    let mut by_interface: Vec<&Contribution> = contributions.iter().collect();
    by_interface.sort_by_key(|c| (c.source.interface_precedence(), c.source));

    let mut devices: BTreeMap<MacAddress, DeviceRecord> = BTreeMap::new();

    for contribution in &by_value {
        let source = contribution.source;
        for (mac, partial) in &contribution.table.records {
            let record = devices.entry(*mac).or_insert_with(|| DeviceRecord {
                mac: *mac,
                ip: None,
                hostname: None,
                interface: None,
                source,
                sources: BTreeSet::new(),
                lease_expires: None,
                last_seen: observed_at,
            });
            record.sources.insert(source);
            if source.precedence() >= record.source.precedence() {
                record.source = source;
            }
            if partial.ip.is_some() {
                record.ip = partial.ip;
            }
            if partial.hostname.is_some() {
                record.hostname = partial.hostname.clone();
            }
            if partial.lease_expires.is_some() {
                record.lease_expires = partial.lease_expires;
            }
        }
    }

    for contribution in &by_interface {
        for (mac, partial) in &contribution.table.records {
            if let Some(interface) = &partial.interface
                && let Some(record) = devices.get_mut(mac)
            {
                record.interface = Some(interface.clone());
            }
        }
    }

    Registry { devices }
}

/// Result of one full cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub registry: Registry,
    pub diff: RegistryDiff,
}

/// Owns the registry of one collector and the previous cycle's view.
#[derive(Debug, Clone, Default)]
pub struct MergeEngine {
    current: Registry,
    cycles: u64,
}

impl MergeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry produced by the last completed cycle.
    pub fn registry(&self) -> &Registry {
        &self.current
    }

    /// Number of completed cycles.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Merges a cycle, replaces the registry and reports what changed.
    pub fn merge_cycle(
        &mut self,
        contributions: &[Contribution],
        observed_at: DateTime<Utc>,
    ) -> CycleReport {
        let registry = merge(contributions, observed_at);
        let diff = RegistryDiff::between(&self.current, &registry);
        log::debug!(
            "cycle {}: {} devices, {} new, {} gone",
            self.cycles + 1,
            registry.len(),
            diff.newly_connected.len(),
            diff.disconnected.len()
        );
        self.current = registry.clone();
        self.cycles += 1;
        CycleReport { registry, diff }
    }

    /// Forgets the previous cycle, so every device counts as new next time.
    pub fn reset(&mut self) {
        self.current = Registry::new();
        self.cycles = 0;
    }
}
