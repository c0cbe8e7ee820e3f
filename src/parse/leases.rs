use std::net::IpAddr;

use chrono::{DateTime, Utc};

use crate::mac::MacAddress;

use super::{PartialRecord, PartialTable, normalize_hostname};

/// Parses a dnsmasq lease file.
///
/// One lease per line: `<expiry-epoch> <mac> <ip> <hostname> <client-id>`.
/// An expiry of 0 marks an infinite lease. `duid` header lines written by
/// DHCPv6-enabled builds are ignored.
pub fn parse_leases(raw: &str) -> PartialTable {
    let mut table = PartialTable::new();

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("duid ") {
            continue;
        }
        match parse_lease_line(line) {
            Some((mac, record)) => table.insert(mac, record),
            None => table.skip(line),
        }
    }
    table
}

fn parse_lease_line(line: &str) -> Option<(MacAddress, PartialRecord)> {
    let mut fields = line.split_whitespace();
    let expiry: i64 = fields.next()?.parse().ok()?;
    let mac: MacAddress = fields.next()?.parse().ok()?;
    let ip: IpAddr = fields.next()?.parse().ok()?;
    let hostname = fields.next().and_then(normalize_hostname);

    let lease_expires = if expiry == 0 {
        None
    } else {
        DateTime::<Utc>::from_timestamp(expiry, 0)
    };

    Some((
        mac,
        PartialRecord {
            ip: Some(ip),
            hostname,
            interface: None,
            lease_expires,
        },
    ))
}
