use std::collections::BTreeMap;
use std::net::IpAddr;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::WrtError;
use crate::mac::MacAddress;

use super::{PartialRecord, PartialTable, is_valid_interface_name, normalize_hostname};

/// `{key::value}` blocks embedded in the web UI's `*.live.asp` pages.
static DATA_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{(\w+)::([^\}]*)\}").expect("valid data block regex"));

/// Data blocks the collector reads from status pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusBlock {
    /// `Status_Wireless.live.asp`: MAC, interface, uptime, rates, signal...
    ActiveWireless,
    /// `Status_Lan.live.asp`: hostname, IP, MAC, expiry, lease id.
    DhcpLeases,
    /// `Status_Lan.live.asp`: hostname, IP, MAC, connection count.
    ArpTable,
}

impl StatusBlock {
    pub fn key(self) -> &'static str {
        match self {
            StatusBlock::ActiveWireless => "active_wireless",
            StatusBlock::DhcpLeases => "dhcp_leases",
            StatusBlock::ArpTable => "arp_table",
        }
    }
}

/// Extracts every `{key::value}` block of a status page.
pub fn status_blocks(page: &str) -> BTreeMap<String, String> {
    DATA_BLOCK
        .captures_iter(page)
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        .collect()
}

/// Splits a JavaScript-ish array literal (`'a','b', 'c'`) into elements.
fn array_elements(value: &str) -> Vec<String> {
    if value.trim().is_empty() {
        return Vec::new();
    }
    value
        .split(',')
        .map(|e| e.trim().trim_matches(|c| c == '\'' || c == '"').trim().to_string())
        .collect()
}

fn element_mac(element: &str) -> Option<MacAddress> {
    if element.contains(':') || element.contains('-') {
        element.parse().ok()
    } else {
        None
    }
}

/// Parses one data block of a status page.
///
/// Array strides differ between firmware builds, so entries are anchored on
/// MAC elements: wireless entries take the interface that follows the MAC,
/// lease and ARP entries take the hostname and IP that precede it.
///
/// Fails with [`WrtError::ParseError`] when the block is missing, which
/// means the page layout changed. A present but empty block is an empty
/// table.
pub fn parse_status_page(page: &str, block: StatusBlock) -> Result<PartialTable, WrtError> {
    let blocks = status_blocks(page);
    let value = blocks.get(block.key()).ok_or_else(|| {
        WrtError::ParseError(format!("status page has no '{}' block", block.key()))
    })?;
    let elements = array_elements(value);
    let mut table = PartialTable::new();

    for (idx, element) in elements.iter().enumerate() {
        let Some(mac) = element_mac(element) else {
            continue;
        };
        match block {
            StatusBlock::ActiveWireless => {
                let interface = elements
                    .get(idx + 1)
                    .filter(|e| element_mac(e).is_none() && is_valid_interface_name(e))
                    .cloned();
                table.insert(
                    mac,
                    PartialRecord {
                        interface,
                        ..Default::default()
                    },
                );
            }
            StatusBlock::DhcpLeases | StatusBlock::ArpTable => {
                let ip = idx
                    .checked_sub(1)
                    .and_then(|i| elements.get(i))
                    .and_then(|e| e.parse::<IpAddr>().ok());
                let Some(ip) = ip else {
                    table.skip(element);
                    continue;
                };
                let hostname = idx
                    .checked_sub(2)
                    .and_then(|i| elements.get(i))
                    .and_then(|e| normalize_hostname(e));
                table.insert(
                    mac,
                    PartialRecord {
                        ip: Some(ip),
                        hostname,
                        ..Default::default()
                    },
                );
            }
        }
    }
    Ok(table)
}
