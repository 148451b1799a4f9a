//! IPv4 address ranges that make up an allocatable pool.
//!
//! A pool is described in text as a list of inclusive ranges, e.g.
//! `"10.0.0.10-10.0.0.20, 10.0.0.40 10.0.0.50 - 10.0.0.60"`. Entries are
//! separated by commas or whitespace; a bare address is a one-address range.
//! The parsed [`AddressRangeCollection`] is sorted and its ranges are
//! pairwise disjoint, which lets membership and "next address" queries use a
//! binary search instead of walking every address.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{Error, Result};

/// An inclusive range of IPv4 addresses, `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    start: Ipv4Addr,
    end: Ipv4Addr,
}

impl AddressRange {
    /// Creates a range, rejecting `start > end`.
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self> {
        if start > end {
            return Err(Error::Config(format!(
                "Range start {} is greater than end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// A range holding exactly one address.
    pub fn single(ip: Ipv4Addr) -> Self {
        Self { start: ip, end: ip }
    }

    pub fn start(&self) -> Ipv4Addr {
        self.start
    }

    pub fn end(&self) -> Ipv4Addr {
        self.end
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.start <= ip && ip <= self.end
    }

    /// Number of addresses in the range.
    pub fn len(&self) -> u64 {
        u64::from(u32::from(self.end)) - u64::from(u32::from(self.start)) + 1
    }

    /// Always false; a range holds at least one address.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Iterates every address in ascending order.
    pub fn addresses(&self) -> impl Iterator<Item = Ipv4Addr> + use<> {
        (u32::from(self.start)..=u32::from(self.end)).map(Ipv4Addr::from)
    }

    fn parse_entry(entry: &str) -> Result<Self> {
        let parse_ip = |text: &str| {
            text.parse::<Ipv4Addr>().map_err(|_| {
                Error::Config(format!("Invalid address {:?} in range {:?}", text, entry))
            })
        };

        match entry.split_once('-') {
            Some((start, end)) => Self::new(parse_ip(start)?, parse_ip(end)?),
            None => Ok(Self::single(parse_ip(entry)?)),
        }
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// An ordered set of disjoint [`AddressRange`]s.
///
/// Built once per request from the client's merged options and never
/// mutated afterwards. An empty collection is valid; allocating from it
/// always fails.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressRangeCollection {
    ranges: Vec<AddressRange>,
}

impl AddressRangeCollection {
    /// Builds a collection from ranges in any order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if any two ranges overlap.
    pub fn new(mut ranges: Vec<AddressRange>) -> Result<Self> {
        ranges.sort_by_key(|range| range.start);

        for pair in ranges.windows(2) {
            if pair[1].start <= pair[0].end {
                return Err(Error::Config(format!(
                    "Ranges {} and {} overlap",
                    pair[0], pair[1]
                )));
            }
        }

        Ok(Self { ranges })
    }

    /// Parses a textual range specification.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on a malformed address, `start > end`, or
    /// overlapping ranges.
    pub fn parse(spec: &str) -> Result<Self> {
        let joined = spec.split('-').map(str::trim).collect::<Vec<_>>().join("-");
        let ranges = joined
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|entry| !entry.is_empty())
            .map(AddressRange::parse_entry)
            .collect::<Result<Vec<_>>>()?;
        Self::new(ranges)
    }

    pub fn ranges(&self) -> &[AddressRange] {
        &self.ranges
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let index = self.ranges.partition_point(|range| range.end < ip);
        self.ranges
            .get(index)
            .is_some_and(|range| range.contains(ip))
    }

    /// Iterates every address of every range in ascending order.
    ///
    /// Each call starts a fresh pass from the lowest address.
    pub fn all_addresses(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.ranges.iter().flat_map(AddressRange::addresses)
    }

    /// Returns the lowest address in the collection strictly greater than `ip`.
    pub fn first_address_after(&self, ip: Ipv4Addr) -> Option<Ipv4Addr> {
        let index = self.ranges.partition_point(|range| range.end <= ip);
        let range = self.ranges.get(index)?;
        if range.start > ip {
            Some(range.start)
        } else {
            // range.end > ip, so the increment cannot overflow
            Some(Ipv4Addr::from(u32::from(ip) + 1))
        }
    }

    /// Total number of addresses across all ranges.
    pub fn len(&self) -> u64 {
        self.ranges.iter().map(AddressRange::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl FromStr for AddressRangeCollection {
    type Err = Error;

    fn from_str(spec: &str) -> Result<Self> {
        Self::parse(spec)
    }
}

impl fmt::Display for AddressRangeCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, range) in self.ranges.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", range)?;
        }
        Ok(())
    }
}
