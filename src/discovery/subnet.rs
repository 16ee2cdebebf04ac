//! IPv4 subnets.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use super::DiscoveryError;

/// Smallest prefix accepted; a /16 is already 65534 hosts.
pub const MIN_PREFIX: u8 = 16;

/// An IPv4 network in CIDR form, host bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet {
    network: Ipv4Addr,
    prefix: u8,
}

impl Subnet {
    pub fn parse(cidr: &str) -> Result<Self, DiscoveryError> {
        let invalid = |reason: &str| DiscoveryError::InvalidSubnet {
            cidr: cidr.to_string(),
            reason: reason.to_string(),
        };

        let (addr, prefix) = cidr
            .trim()
            .split_once('/')
            .ok_or_else(|| invalid("expected <address>/<prefix>"))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| invalid("address is not IPv4"))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| invalid("prefix is not a number"))?;
        if prefix > 32 {
            return Err(invalid("prefix must be at most 32"));
        }
        if prefix < MIN_PREFIX {
            return Err(invalid("prefix must be at least 16"));
        }

        Ok(Self {
            network: Ipv4Addr::from(u32::from(addr) & mask(prefix)),
            prefix,
        })
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => u32::from(v4) & mask(self.prefix) == u32::from(self.network),
            IpAddr::V6(_) => false,
        }
    }

    /// Usable host addresses: network and broadcast are skipped except for
    /// /31 and /32, where every address is a host.
    pub fn hosts(&self) -> impl Iterator<Item = IpAddr> {
        let base = u32::from(self.network);
        let size = 1u64 << (32 - self.prefix);
        let (first, last) = if size <= 2 {
            (0, size - 1)
        } else {
            (1, size - 2)
        };
        (first..=last).map(move |offset| IpAddr::V4(Ipv4Addr::from(base + offset as u32)))
    }

    pub fn host_count(&self) -> usize {
        let size = 1usize << (32 - self.prefix);
        if size <= 2 {
            size
        } else {
            size - 2
        }
    }
}

impl FromStr for Subnet {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Subnet::parse(s)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    }
}
