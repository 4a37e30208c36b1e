//! Networking utilities for edgegate.
//!
//! This library provides:
//! - IPv4/IPv6 prefix parsing from CIDR notation
//! - A longest-prefix-match membership index used for source admission

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use thiserror::Error;

mod index;

pub use index::PrefixIndex;

/// Networking errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    /// Invalid, unparseable or absent IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),
}

// ============================================================================
// Prefixes
// ============================================================================

/// An IP prefix (network address plus prefix length).
///
/// Host bits are always masked off, so `10.1.2.3/8` is stored as `10.0.0.0/8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpPrefix {
    /// Network address of the prefix.
    pub address: IpAddr,

    /// Prefix length (at most 32 for IPv4, 128 for IPv6).
    pub prefix_len: u8,
}

impl IpPrefix {
    /// Create a new prefix, masking the address to the prefix length.
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, NetworkError> {
        let max = max_prefix_len(address);
        if prefix_len > max {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds {}",
                prefix_len, max
            )));
        }

        Ok(Self {
            address: mask(address, prefix_len),
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g. "173.245.48.0/20" or "2400:cb00::/32").
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let s = s.trim();
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let address = IpAddr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(s.to_string()))?;

        Self::new(address, prefix_len)
    }

    /// Check if an address is within this prefix.
    ///
    /// Addresses of the other family never match, except IPv4-mapped IPv6
    /// addresses, which are compared as IPv4.
    pub fn contains(&self, addr: IpAddr) -> bool {
        let addr = addr.to_canonical();
        match (self.address, addr) {
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {
                mask(addr, self.prefix_len) == self.address
            }
            _ => false,
        }
    }

    /// Whether this is an IPv4 prefix.
    pub fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }

    /// The prefix's network address as left-aligned 128 bits.
    pub(crate) fn bits(&self) -> u128 {
        left_aligned_bits(self.address)
    }
}

impl FromStr for IpPrefix {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_cidr(s)
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

fn max_prefix_len(addr: IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Mask an address to a prefix length.
fn mask(addr: IpAddr, prefix_len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u32::from_be_bytes(v4.octets());
            let mask = if prefix_len == 0 {
                0
            } else if prefix_len >= 32 {
                u32::MAX
            } else {
                u32::MAX << (32 - prefix_len)
            };
            IpAddr::V4(Ipv4Addr::from(bits & mask))
        }
        IpAddr::V6(v6) => {
            let bits = u128::from_be_bytes(v6.octets());
            let mask = if prefix_len == 0 {
                0
            } else if prefix_len >= 128 {
                u128::MAX
            } else {
                u128::MAX << (128 - prefix_len)
            };
            IpAddr::V6(Ipv6Addr::from(bits & mask))
        }
    }
}

/// Address bits aligned to the most significant end of a u128.
///
/// IPv4 addresses occupy the top 32 bits, so both families walk the trie
/// from bit 0.
pub(crate) fn left_aligned_bits(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => (u32::from_be_bytes(v4.octets()) as u128) << 96,
        IpAddr::V6(v6) => u128::from_be_bytes(v6.octets()),
    }
}
