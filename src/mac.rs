//! 48-bit Ethernet hardware addresses.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// An Ethernet MAC address, the key every lease is tracked under.
///
/// Printed in lowercase colon-hex form (`aa:bb:cc:dd:ee:ff`). Parsing also
/// accepts `-` as the separator and upper-case digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Reads the address from a packet's `chaddr` field.
    ///
    /// Only Ethernet-sized hardware addresses are accepted.
    pub fn from_chaddr(chaddr: &[u8]) -> Result<Self> {
        let octets: [u8; 6] = chaddr
            .get(..6)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| {
                Error::InvalidPacket(format!(
                    "Hardware address too short: {} bytes",
                    chaddr.len()
                ))
            })?;
        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a, b, c, d, e, g
        )
    }
}

impl FromStr for MacAddress {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        let invalid = || Error::Config(format!("Invalid MAC address: {:?}", value));

        let normalized = value.trim().replace('-', ":");
        let mut octets = [0u8; 6];
        let mut parts = normalized.split(':');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.is_empty() || part.len() > 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(octets))
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(octets: [u8; 6]) -> Self {
        Self(octets)
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
