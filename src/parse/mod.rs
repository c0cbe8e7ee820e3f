//! Parsers for router command output.
//!
//! Each grammar has one pure function that turns raw text into a
//! [`PartialTable`]: a mapping from MAC address to whatever attributes that
//! source knows about. Firmware builds disagree on formats, so parsers never
//! fail on individual lines. A line that cannot be understood is skipped and
//! counted in [`PartialTable::skipped`]. Only the status-page parser can fail
//! as a whole, when the data block it looks for is missing entirely.
//!
//! # Grammars
//!
//! - [`parse_interfaces`] - wireless interface enumeration
//! - [`parse_associations`] - per-interface association dumps
//! - [`parse_arp`] - `arp -n`
//! - [`parse_neighbors`] - `ip neigh`
//! - [`parse_leases`] - dnsmasq lease file
//! - [`parse_status_page`] - web UI `*.live.asp` pages
//! - [`parse_counter`] - kernel byte counters

use std::collections::BTreeMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mac::MacAddress;

pub use arp::parse_arp;
pub use counters::parse_counter;
pub use assoc::{AssociationFormat, parse_associations};
pub use interfaces::{is_valid_interface_name, parse_interfaces};
pub use leases::parse_leases;
pub use neigh::{NeighborState, parse_neighbors};
pub use status::{StatusBlock, parse_status_page, status_blocks};

mod arp;
mod assoc;
mod counters;
mod interfaces;
mod leases;
mod neigh;
mod status;

/// Attributes one source reports for one MAC address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialRecord {
    pub ip: Option<IpAddr>,
    pub hostname: Option<String>,
    pub interface: Option<String>,
    /// Lease expiry, only reported by lease sources.
    pub lease_expires: Option<DateTime<Utc>>,
}

impl PartialRecord {
    pub fn is_empty(&self) -> bool {
        self.ip.is_none()
            && self.hostname.is_none()
            && self.interface.is_none()
            && self.lease_expires.is_none()
    }
}

/// Output of one parser run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialTable {
    pub records: BTreeMap<MacAddress, PartialRecord>,
    /// Non-empty lines that could not be understood.
    pub skipped: usize,
}

impl PartialTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, mac: &MacAddress) -> bool {
        self.records.contains_key(mac)
    }

    pub fn get(&self, mac: &MacAddress) -> Option<&PartialRecord> {
        self.records.get(mac)
    }

    /// Inserts or replaces the record for `mac` (last write wins).
    pub fn insert(&mut self, mac: MacAddress, record: PartialRecord) {
        self.records.insert(mac, record);
    }

    /// Layers `other` on top of this table: per MAC, every attribute `other`
    /// knows replaces the one here. Skip counts add up.
    pub fn overlay(&mut self, other: PartialTable) {
        for (mac, top) in other.records {
            let record = self.records.entry(mac).or_default();
            if top.ip.is_some() {
                record.ip = top.ip;
            }
            if top.hostname.is_some() {
                record.hostname = top.hostname;
            }
            if top.interface.is_some() {
                record.interface = top.interface;
            }
            if top.lease_expires.is_some() {
                record.lease_expires = top.lease_expires;
            }
        }
        self.skipped += other.skipped;
    }

    pub(crate) fn skip(&mut self, line: &str) {
        log::trace!("skipping unparseable line: {line:?}");
        self.skipped += 1;
    }
}

/// Hostname placeholders used by dnsmasq and the web UI for "unknown".
pub(crate) fn normalize_hostname(raw: &str) -> Option<String> {
    let host = raw.trim();
    if host.is_empty() || host == "*" || host.eq_ignore_ascii_case("unknown") {
        None
    } else {
        Some(host.to_string())
    }
}
