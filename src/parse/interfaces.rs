use once_cell::sync::Lazy;
use regex::Regex;

static INTERFACE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,31}$").expect("valid interface regex"));

/// True for names that are safe to interpolate into a shell command.
pub fn is_valid_interface_name(name: &str) -> bool {
    INTERFACE_NAME.is_match(name)
}

/// Parses wireless interface enumeration output.
///
/// Accepts plain tokens (`eth1 eth2`), nvram dumps (`wl0_ifname=eth1`) and
/// `iw dev` lines (`Interface wlan0`). Discovery order is kept and duplicates
/// are dropped. Empty input means the router has no radios.
pub fn parse_interfaces(raw: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let mut push = |name: &str| {
        if is_valid_interface_name(name) && !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        } else if !is_valid_interface_name(name) {
            log::warn!("ignoring unsafe interface name {name:?}");
        }
    };

    // `iw dev` output interleaves attribute lines; only Interface lines count.
    let iw_listing = raw
        .lines()
        .any(|line| line.split_whitespace().next() == Some("Interface"));

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut tokens = line.split_whitespace();
        if iw_listing {
            if tokens.next() == Some("Interface")
                && let Some(name) = tokens.next()
            {
                push(name);
            }
            continue;
        }
        if let Some((_, value)) = line.split_once('=') {
            for token in value.split_whitespace() {
                push(token);
            }
            continue;
        }
        for token in tokens {
            push(token);
        }
    }
    names
}
