use std::net::IpAddr;

use crate::mac::MacAddress;

use super::{PartialRecord, PartialTable};

/// Parses `arp -n` output.
///
/// Handles the busybox layout (`? (10.0.0.2) at 01:02:.. [ether]  on br0`)
/// and the net-tools column layout (`10.0.0.2  ether  01:02:..  C  br0`).
/// Incomplete entries and all-zero hardware addresses are discarded.
pub fn parse_arp(raw: &str) -> PartialTable {
    let mut table = PartialTable::new();

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("Address") {
            continue;
        }
        let lower = line.to_ascii_lowercase();
        if lower.contains("incomplete") || lower.contains("no entry") {
            continue;
        }

        let Some(ip) = arp_ip(line) else {
            table.skip(line);
            continue;
        };
        let Some(mac) = MacAddress::find_in(line) else {
            table.skip(line);
            continue;
        };
        if mac.is_zero() {
            continue;
        }

        table.insert(
            mac,
            PartialRecord {
                ip: Some(ip),
                interface: arp_interface(line),
                ..Default::default()
            },
        );
    }
    table
}

fn arp_ip(line: &str) -> Option<IpAddr> {
    if let Some(start) = line.find('(')
        && let Some(len) = line[start + 1..].find(')')
    {
        return line[start + 1..start + 1 + len].parse().ok();
    }
    line.split_whitespace().next()?.parse().ok()
}

fn arp_interface(line: &str) -> Option<String> {
    if let Some(pos) = line.rfind(" on ") {
        return line[pos + 4..]
            .split_whitespace()
            .next()
            .map(str::to_string);
    }
    // net-tools: the interface is the last column.
    let last = line.split_whitespace().last()?;
    if last.parse::<MacAddress>().is_err() && super::is_valid_interface_name(last) && last.len() > 1 {
        Some(last.to_string())
    } else {
        None
    }
}
