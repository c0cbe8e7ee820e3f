use crate::catalog::InterfaceFraming;
use crate::mac::MacAddress;

use super::{PartialRecord, PartialTable};

/// Line formats found in association dumps across firmware builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationFormat {
    /// Broadcom `wl assoclist`: `assoclist 01:02:03:04:05:06`.
    WlAssoclist,
    /// mac80211 `iw station dump`: `Station 01:02:03:04:05:06 (on wlan0)`
    /// followed by indented attribute lines.
    IwStationDump,
    /// A MAC address alone on the line (pre-filtered output).
    BareMac,
    /// Fallback: the first MAC address found anywhere on the line.
    BestEffort,
}

impl AssociationFormat {
    /// Classifies a line and extracts its MAC address.
    pub fn detect(line: &str) -> Option<(AssociationFormat, MacAddress)> {
        let mut tokens = line.split_whitespace();
        let first = tokens.next()?;
        match first {
            "assoclist" => tokens
                .next()
                .and_then(|t| t.parse().ok())
                .map(|mac| (AssociationFormat::WlAssoclist, mac)),
            "Station" => tokens
                .next()
                .and_then(|t| t.parse().ok())
                .map(|mac| (AssociationFormat::IwStationDump, mac)),
            _ => {
                if tokens.next().is_none()
                    && let Ok(mac) = first.parse()
                {
                    return Some((AssociationFormat::BareMac, mac));
                }
                MacAddress::find_in(line).map(|mac| (AssociationFormat::BestEffort, mac))
            }
        }
    }
}

/// `(on wlan0)` suffix of an iw station line.
fn station_interface(line: &str) -> Option<&str> {
    let start = line.find("(on ")? + 4;
    let end = line[start..].find(')')? + start;
    Some(line[start..end].trim())
}

/// Parses association dumps, optionally split into per-interface sections.
///
/// When `framing` is given, marker lines switch the current interface and
/// every client below a marker is attributed to it. A MAC seen under two
/// interfaces keeps the later one.
pub fn parse_associations(raw: &str, framing: Option<&InterfaceFraming>) -> PartialTable {
    let mut table = PartialTable::new();
    let mut current_interface: Option<String> = None;
    let mut in_station_block = false;

    for raw_line in raw.lines() {
        if raw_line.trim().is_empty() {
            continue;
        }
        if let Some(framing) = framing
            && let Some(interface) = framing.interface_of(raw_line)
        {
            current_interface = Some(interface.to_string());
            in_station_block = false;
            continue;
        }

        // Attribute lines below a Station header are expected noise.
        if in_station_block && raw_line.starts_with([' ', '\t']) {
            continue;
        }

        match AssociationFormat::detect(raw_line) {
            Some((format, mac)) => {
                in_station_block = format == AssociationFormat::IwStationDump;
                let interface = current_interface.clone().or_else(|| {
                    if format == AssociationFormat::IwStationDump {
                        station_interface(raw_line).map(str::to_string)
                    } else {
                        None
                    }
                });
                table.insert(
                    mac,
                    PartialRecord {
                        interface,
                        ..Default::default()
                    },
                );
            }
            None => {
                in_station_block = false;
                table.skip(raw_line);
            }
        }
    }
    table
}
