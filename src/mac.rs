//! Canonical MAC addresses.
//!
//! Router output spells the same address many ways: `AB:CD:...` from `wl`,
//! `ab-cd-...` from some web pages, `1:2:3:4:5:6` from busybox tools that
//! drop leading zeros. [`MacAddress`] parses all of them and always prints
//! the lowercase colon-separated form, so it can be used as a registry key.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::WrtError;

/// Finds a separated MAC address anywhere inside a line.
pub(crate) static MAC_IN_TEXT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|[^0-9a-f:-])((?:[0-9a-f]{1,2}[:-]){5}[0-9a-f]{1,2})(?:$|[^0-9a-f:-])")
        .expect("valid mac regex")
});

/// A 6-octet hardware address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// True for `00:00:00:00:00:00`, which the kernel uses for unresolved
    /// ARP entries.
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }

    /// Returns the first MAC address found in `text`, if any.
    pub fn find_in(text: &str) -> Option<MacAddress> {
        MAC_IN_TEXT
            .captures(text)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }
}

impl FromStr for MacAddress {
    type Err = WrtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let invalid = || WrtError::InvalidMacAddress(trimmed.to_string());

        let parts: Vec<&str> = if trimmed.contains(':') || trimmed.contains('-') {
            trimmed.split([':', '-']).collect()
        } else if trimmed.len() == 12 && trimmed.is_ascii() {
            (0..6).map(|i| &trimmed[i * 2..i * 2 + 2]).collect()
        } else {
            return Err(invalid());
        };

        if parts.len() != 6 {
            return Err(invalid());
        }

        let mut octets = [0u8; 6];
        for (slot, part) in octets.iter_mut().zip(parts) {
            if part.is_empty() || part.len() > 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        Ok(MacAddress(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({self})")
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
