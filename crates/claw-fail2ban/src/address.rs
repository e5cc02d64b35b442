//! IP address and CIDR matching.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Fail2BanError, Fail2BanResult};

/// A single entry of an address list: either one address or a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpEntry {
    /// Matches exactly one address.
    Single(IpAddr),
    /// Matches every address inside the prefix.
    Network(IpNet),
}

impl IpEntry {
    /// Parse `a.b.c.d`, `a.b.c.d/n` or their IPv6 equivalents.
    ///
    /// # Errors
    ///
    /// Returns `Fail2BanError::InvalidAddress` for anything else.
    pub fn parse(text: &str) -> Fail2BanResult<Self> {
        let invalid = |reason: String| Fail2BanError::InvalidAddress {
            input: text.to_string(),
            reason,
        };

        if text.contains('/') {
            text.parse::<IpNet>()
                .map(Self::Network)
                .map_err(|e| invalid(e.to_string()))
        } else {
            text.parse::<IpAddr>()
                .map(|ip| Self::Single(ip.to_canonical()))
                .map_err(|e| invalid(e.to_string()))
        }
    }

    /// Check whether `candidate` matches this entry.
    ///
    /// Malformed candidates never match. IPv4-mapped IPv6 candidates match
    /// as their IPv4 address.
    #[must_use]
    pub fn contains(&self, candidate: &str) -> bool {
        match parse_candidate(candidate) {
            Some(ip) => self.contains_addr(&ip),
            None => false,
        }
    }

    /// Check whether an already parsed address matches this entry.
    #[must_use]
    pub fn contains_addr(&self, ip: &IpAddr) -> bool {
        let ip = ip.to_canonical();
        match self {
            Self::Single(addr) => *addr == ip,
            Self::Network(net) => net.contains(&ip),
        }
    }
}

impl FromStr for IpEntry {
    type Err = Fail2BanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for IpEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(addr) => write!(f, "{addr}"),
            Self::Network(net) => write!(f, "{net}"),
        }
    }
}

/// An ordered list of address entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpSet {
    entries: Vec<IpEntry>,
}

impl IpSet {
    /// Create an empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Parse a list of addresses and networks.
    ///
    /// # Errors
    ///
    /// Returns `Fail2BanError::InvalidAddressList` naming the first entry that
    /// failed to parse.
    pub fn parse<I, S>(list: I) -> Fail2BanResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries = list
            .into_iter()
            .enumerate()
            .map(|(index, text)| {
                let text = text.as_ref();
                IpEntry::parse(text).map_err(|e| Fail2BanError::InvalidAddressList {
                    index,
                    input: text.to_string(),
                    reason: match e {
                        Fail2BanError::InvalidAddress { reason, .. } => reason,
                        other => other.to_string(),
                    },
                })
            })
            .collect::<Fail2BanResult<Vec<_>>>()?;

        Ok(Self { entries })
    }

    /// Check whether `candidate` matches any entry.
    ///
    /// Malformed candidates never match.
    #[must_use]
    pub fn contains(&self, candidate: &str) -> bool {
        match parse_candidate(candidate) {
            Some(ip) => self.contains_addr(&ip),
            None => false,
        }
    }

    /// Check whether an already parsed address matches any entry.
    #[must_use]
    pub fn contains_addr(&self, ip: &IpAddr) -> bool {
        self.entries.iter().any(|entry| entry.contains_addr(ip))
    }

    /// Entries in insertion order.
    #[must_use]
    pub fn entries(&self) -> &[IpEntry] {
        &self.entries
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<Vec<IpEntry>> for IpSet {
    fn from(entries: Vec<IpEntry>) -> Self {
        Self { entries }
    }
}

impl Serialize for IpSet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.entries.iter().map(ToString::to_string))
    }
}

impl<'de> Deserialize<'de> for IpSet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Vec::<String>::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

fn parse_candidate(candidate: &str) -> Option<IpAddr> {
    match candidate.parse::<IpAddr>() {
        Ok(ip) => Some(ip.to_canonical()),
        Err(e) => {
            debug!(candidate = %candidate, error = %e, "Unparseable address, treating as no match");
            None
        }
    }
}
