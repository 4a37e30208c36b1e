//! Prefix membership index.
//!
//! A binary trie per address family answering "is this address inside any
//! registered prefix?". Inserts need `&mut self`; once the index is shared
//! behind an `Arc` it is read-only and lookups need no locking.

use std::net::IpAddr;

use crate::{left_aligned_bits, IpPrefix, NetworkError};

/// A trie node. Children are indices into the owning arena.
#[derive(Debug, Default, Clone)]
struct Node {
    children: [Option<u32>; 2],
    terminal: bool,
}

#[derive(Debug, Clone)]
struct Trie {
    nodes: Vec<Node>,
}

impl Trie {
    fn new() -> Self {
        Self {
            nodes: vec![Node::default()],
        }
    }

    /// Mark the path for `bits`/`len` as a prefix. Returns false if it was
    /// already present.
    fn insert(&mut self, bits: u128, len: u8) -> bool {
        let mut node = 0usize;
        for i in 0..len {
            let bit = bit_at(bits, i);
            node = match self.nodes[node].children[bit] {
                Some(child) => child as usize,
                None => {
                    let child = self.nodes.len();
                    self.nodes.push(Node::default());
                    self.nodes[node].children[bit] = Some(child as u32);
                    child
                }
            };
        }

        let fresh = !self.nodes[node].terminal;
        self.nodes[node].terminal = true;
        fresh
    }

    /// Length of the longest registered prefix covering `bits`.
    fn longest_match(&self, bits: u128) -> Option<u8> {
        let mut node = 0usize;
        let mut best = self.nodes[0].terminal.then_some(0u8);

        for i in 0..128u8 {
            match self.nodes[node].children[bit_at(bits, i)] {
                Some(child) => {
                    node = child as usize;
                    if self.nodes[node].terminal {
                        best = Some(i + 1);
                    }
                }
                None => break,
            }
        }

        best
    }
}

fn bit_at(bits: u128, i: u8) -> usize {
    ((bits >> (127 - i as u32)) & 1) as usize
}

/// Longest-prefix-match index over IPv4 and IPv6 prefixes.
#[derive(Debug, Clone)]
pub struct PrefixIndex {
    v4: Trie,
    v6: Trie,
    len: usize,
}

impl PrefixIndex {
    /// Create an empty index. An empty index admits nothing.
    pub fn new() -> Self {
        Self {
            v4: Trie::new(),
            v6: Trie::new(),
            len: 0,
        }
    }

    /// Insert a prefix. Inserting the same prefix twice is a no-op.
    pub fn insert(&mut self, prefix: IpPrefix) {
        let trie = if prefix.is_ipv4() {
            &mut self.v4
        } else {
            &mut self.v6
        };

        if trie.insert(prefix.bits(), prefix.prefix_len) {
            self.len += 1;
        }
    }

    /// Parse and insert a prefix in CIDR notation.
    pub fn insert_cidr(&mut self, cidr: &str) -> Result<(), NetworkError> {
        let prefix = IpPrefix::from_cidr(cidr)?;
        self.insert(prefix);
        Ok(())
    }

    /// Insert every valid CIDR, skipping malformed entries.
    ///
    /// Returns the number of entries skipped.
    pub fn extend_lossy<'a, I>(&mut self, cidrs: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut skipped = 0;
        for cidr in cidrs {
            if self.insert_cidr(cidr).is_err() {
                skipped += 1;
            }
        }
        skipped
    }

    /// Check whether an address is inside any registered prefix.
    ///
    /// The unspecified address (`0.0.0.0` / `::`) is treated as absent and
    /// fails with [`NetworkError::InvalidAddress`] rather than returning false,
    /// even when `0.0.0.0/0` or `::/0` is registered. IPv4-mapped IPv6
    /// addresses are looked up as IPv4.
    pub fn contains(&self, addr: IpAddr) -> Result<bool, NetworkError> {
        Ok(self.longest_match(addr)?.is_some())
    }

    /// Parse an address and check membership.
    pub fn contains_str(&self, addr: &str) -> Result<bool, NetworkError> {
        let ip = addr
            .trim()
            .parse::<IpAddr>()
            .map_err(|_| NetworkError::InvalidAddress(addr.to_string()))?;
        self.contains(ip)
    }

    /// The most specific registered prefix covering `addr`, if any.
    pub fn longest_match(&self, addr: IpAddr) -> Result<Option<IpPrefix>, NetworkError> {
        let addr = addr.to_canonical();
        if addr.is_unspecified() {
            return Err(NetworkError::InvalidAddress(addr.to_string()));
        }

        let trie = if addr.is_ipv4() { &self.v4 } else { &self.v6 };
        match trie.longest_match(left_aligned_bits(addr)) {
            Some(len) => IpPrefix::new(addr, len).map(Some),
            None => Ok(None),
        }
    }

    /// Number of distinct prefixes in the index.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the index holds no prefixes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for PrefixIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> FromIterator<&'a str> for PrefixIndex {
    /// Build an index from CIDR strings, skipping malformed entries.
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        let mut index = Self::new();
        index.extend_lossy(iter);
        index
    }
}
