use std::net::IpAddr;

use crate::mac::MacAddress;

use super::{PartialRecord, PartialTable};

/// Neighbor unreachability detection state from `ip neigh`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborState {
    Reachable,
    Stale,
    Delay,
    Probe,
    Permanent,
    Noarp,
    Failed,
    Incomplete,
    None,
}

impl NeighborState {
    pub fn from_token(token: &str) -> Option<Self> {
        let state = match token.to_ascii_uppercase().as_str() {
            "REACHABLE" => NeighborState::Reachable,
            "STALE" => NeighborState::Stale,
            "DELAY" => NeighborState::Delay,
            "PROBE" => NeighborState::Probe,
            "PERMANENT" => NeighborState::Permanent,
            "NOARP" => NeighborState::Noarp,
            "FAILED" => NeighborState::Failed,
            "INCOMPLETE" => NeighborState::Incomplete,
            "NONE" => NeighborState::None,
            _ => return None,
        };
        Some(state)
    }

    /// Reachable or stale-but-known entries describe a present device.
    pub fn is_known(self) -> bool {
        matches!(
            self,
            NeighborState::Reachable
                | NeighborState::Stale
                | NeighborState::Delay
                | NeighborState::Probe
                | NeighborState::Permanent
        )
    }
}

/// IPv4 beats global IPv6 beats link-local IPv6.
fn address_rank(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 2,
        IpAddr::V6(v6) if (v6.segments()[0] & 0xffc0) == 0xfe80 => 0,
        IpAddr::V6(_) => 1,
    }
}

/// Parses `ip neigh` output.
///
/// Line shape: `<addr> dev <if> lladdr <mac> [router] <STATE>`. Only entries
/// in a known state with a link-layer address are kept. When one MAC owns
/// several addresses the best ranked one wins, the later line on ties.
pub fn parse_neighbors(raw: &str) -> PartialTable {
    let mut table = PartialTable::new();

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();

        let Some(ip) = tokens.first().and_then(|t| t.parse::<IpAddr>().ok()) else {
            table.skip(line);
            continue;
        };
        let Some(state) = tokens.last().and_then(|t| NeighborState::from_token(t)) else {
            table.skip(line);
            continue;
        };
        if !state.is_known() {
            continue;
        }
        let Some(mac) = value_after(&tokens, "lladdr").and_then(|t| t.parse::<MacAddress>().ok())
        else {
            continue;
        };
        let interface = value_after(&tokens, "dev").map(str::to_string);

        if let Some(existing) = table.get(&mac).and_then(|r| r.ip)
            && address_rank(&existing) > address_rank(&ip)
        {
            continue;
        }
        table.insert(
            mac,
            PartialRecord {
                ip: Some(ip),
                interface,
                ..Default::default()
            },
        );
    }
    table
}

fn value_after<'a>(tokens: &[&'a str], key: &str) -> Option<&'a str> {
    tokens
        .iter()
        .position(|t| *t == key)
        .and_then(|i| tokens.get(i + 1))
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(s: &str) -> MacAddress {
        s.parse().unwrap()
    }

    const IP_NEIGH: &str = "192.168.1.10 dev br0 lladdr 01:02:03:04:06:08 REACHABLE
192.168.1.11 dev br0 lladdr 08:09:10:11:12:14 STALE
192.168.1.12 dev br0  FAILED
192.168.1.13 dev br0 lladdr 08:09:10:11:12:15 INCOMPLETE
fe80::20c:29ff:fe12:3456 dev br0 lladdr 01:02:03:04:06:08 router STALE
2001:db8::15 dev br0 lladdr aa:bb:cc:dd:ee:ff DELAY
fe80::1 dev br0 lladdr aa:bb:cc:dd:ee:ff REACHABLE
";

    #[test]
    fn only_known_states_are_kept() {
        let table = parse_neighbors(IP_NEIGH);
        assert_eq!(table.len(), 3);
        assert!(!table.contains(&mac("08:09:10:11:12:15")));
        assert_eq!(table.skipped, 0);
    }

    #[test]
    fn ipv4_address_is_preferred_over_link_local() {
        let table = parse_neighbors(IP_NEIGH);
        let record = table.get(&mac("01:02:03:04:06:08")).unwrap();
        assert_eq!(record.ip, Some("192.168.1.10".parse().unwrap()));
        assert_eq!(record.interface.as_deref(), Some("br0"));
    }

    #[test]
    fn global_ipv6_beats_link_local() {
        let table = parse_neighbors(IP_NEIGH);
        let record = table.get(&mac("aa:bb:cc:dd:ee:ff")).unwrap();
        assert_eq!(record.ip, Some("2001:db8::15".parse().unwrap()));
    }

    #[test]
    fn unknown_layout_is_counted() {
        let table = parse_neighbors("Object \"neigh\" is unknown, try \"ip help\".\n");
        assert!(table.is_empty());
        assert_eq!(table.skipped, 1);
    }
}
