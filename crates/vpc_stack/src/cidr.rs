//! IPv4 CIDR blocks and sequential subnet carving.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{StackError, StackResult};

/// An IPv4 network in CIDR notation.
///
/// The address is kept as written; [`Ipv4Cidr::network`] gives the masked
/// base address. `0.0.0.0/0` is the unrestricted range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Cidr {
    address: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(address: Ipv4Addr, prefix: u8) -> StackResult<Self> {
        if prefix > 32 {
            return Err(StackError::InvalidCidr(format!("{}/{}", address, prefix)));
        }
        Ok(Self { address, prefix })
    }

    /// `0.0.0.0/0`.
    pub fn any() -> Self {
        Self {
            address: Ipv4Addr::UNSPECIFIED,
            prefix: 0,
        }
    }

    /// `10.0.0.0/16`, the usual VPC range.
    pub fn private_default() -> Self {
        Self {
            address: Ipv4Addr::new(10, 0, 0, 0),
            prefix: 16,
        }
    }

    /// A single host, `/32`.
    pub fn host(address: Ipv4Addr) -> Self {
        Self { address, prefix: 32 }
    }

    /// Parse either `a.b.c.d/n` or a bare address, which becomes `/32`.
    pub fn parse_host_or_cidr(value: &str) -> StackResult<Self> {
        if value.contains('/') {
            value.parse()
        } else {
            let address = Ipv4Addr::from_str(value.trim())
                .map_err(|_| StackError::InvalidCidr(value.to_string()))?;
            Ok(Self::host(address))
        }
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn is_any(&self) -> bool {
        self.prefix == 0
    }

    fn mask_bits(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix as u32)
        }
    }

    /// Masked base address.
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) & Self::mask_bits(self.prefix))
    }

    /// True when no host bits are set below the prefix.
    pub fn is_aligned(&self) -> bool {
        self.address == self.network()
    }

    /// The same block with host bits cleared.
    pub fn normalized(&self) -> Self {
        Self {
            address: self.network(),
            prefix: self.prefix,
        }
    }

    /// Number of addresses in the block.
    pub fn size(&self) -> u64 {
        1u64 << (32 - self.prefix as u32)
    }

    pub fn contains(&self, other: &Ipv4Cidr) -> bool {
        other.prefix >= self.prefix
            && u32::from(other.network()) & Self::mask_bits(self.prefix) == u32::from(self.network())
    }

    pub fn overlaps(&self, other: &Ipv4Cidr) -> bool {
        self.contains(other) || other.contains(self)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| StackError::InvalidCidr(s.to_string()))?;
        let address = Ipv4Addr::from_str(addr).map_err(|_| StackError::InvalidCidr(s.to_string()))?;
        let prefix = prefix
            .parse::<u8>()
            .map_err(|_| StackError::InvalidCidr(s.to_string()))?;
        Self::new(address, prefix)
    }
}

impl TryFrom<String> for Ipv4Cidr {
    type Error = StackError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Ipv4Cidr> for String {
    fn from(cidr: Ipv4Cidr) -> Self {
        cidr.to_string()
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

/// Hands out consecutive, non-overlapping blocks from a parent range.
#[derive(Debug, Clone)]
pub struct CidrAllocator {
    parent: Ipv4Cidr,
    next: u64,
}

impl CidrAllocator {
    pub fn new(parent: Ipv4Cidr) -> Self {
        Self {
            next: u32::from(parent.network()) as u64,
            parent,
        }
    }

    /// Allocate the next aligned block of the given prefix length.
    pub fn allocate(&mut self, mask: u8) -> StackResult<Ipv4Cidr> {
        let exhausted = || StackError::AddressSpaceExhausted {
            cidr: self.parent.to_string(),
            mask,
        };

        if mask < self.parent.prefix() || mask > 32 {
            return Err(exhausted());
        }

        let block = 1u64 << (32 - mask as u32);
        let start = self.next.div_ceil(block) * block;
        let end = u32::from(self.parent.network()) as u64 + self.parent.size();
        if start + block > end {
            return Err(exhausted());
        }

        self.next = start + block;
        Ipv4Cidr::new(Ipv4Addr::from(start as u32), mask)
    }
}
