//! Prefix tables
//!
//! Loads `ADDRESS/LENGTH` prefix lists, buckets them by family and serves
//! longest-prefix containment tests. The table is sorted once by network
//! address at load time and immutable afterwards; containment runs one
//! binary search per distinct prefix length present, most specific first,
//! so every prefix in an overlapping hierarchy is honored.

use std::net::IpAddr;
use std::path::Path;

use ipnetwork::IpNetwork;
use tracing::debug;

use crate::addr::{AddressFamily, V4, V6};
use crate::error::{Result, SpoofError};

/// One network prefix of a single family.
#[derive(Debug, Clone, Copy)]
pub struct Prefix<F: AddressFamily> {
    net: F::Bits,
    len: u8,
}

impl<F: AddressFamily> Prefix<F> {
    pub fn new(net: F::Bits, len: u8) -> Self {
        Self {
            net: F::network(net, len),
            len,
        }
    }
}

/// Sorted, immutable prefix list for one family.
#[derive(Debug, Clone)]
pub struct PrefixTable<F: AddressFamily> {
    entries: Vec<Prefix<F>>,
    /// Distinct prefix lengths present, longest first.
    lengths: Vec<u8>,
}

impl<F: AddressFamily> Default for PrefixTable<F> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            lengths: Vec::new(),
        }
    }
}

impl<F: AddressFamily> PrefixTable<F> {
    pub fn new(mut entries: Vec<Prefix<F>>) -> Self {
        entries.sort_unstable_by_key(|p| (p.net, p.len));
        let mut lengths: Vec<u8> = entries.iter().map(|p| p.len).collect();
        lengths.sort_unstable_by(|a, b| b.cmp(a));
        lengths.dedup();
        Self { entries, lengths }
    }

    /// Index of a prefix containing `addr`, or `None`; the longest
    /// covering prefix wins.
    ///
    /// A single masked bisection cannot answer containment over the union
    /// of overlapping prefixes (the comparison key changes with each
    /// candidate's length), so the address is masked once per distinct
    /// length in the table and looked up exactly.
    ///
    /// Total: an address of the other family simply never matches.
    pub fn contains(&self, addr: IpAddr) -> Option<usize> {
        let bits = F::bits(addr)?;
        for &len in &self.lengths {
            let masked = F::network(bits, len);
            if let Ok(idx) = self
                .entries
                .binary_search_by(|p| (p.net, p.len).cmp(&(masked, len)))
            {
                return Some(idx);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Both per-family tables loaded from one prefix file.
#[derive(Debug, Clone, Default)]
pub struct PrefixSet {
    pub v4: PrefixTable<V4>,
    pub v6: PrefixTable<V6>,
}

impl PrefixSet {
    /// Empty set; used when no watched-prefix file is configured.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load a prefix file: one `ADDRESS/LENGTH` per line, whitespace
    /// stripped, families intermixed. Lines that do not parse are skipped.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| SpoofError::PrefixFile {
            path: path.to_path_buf(),
            source,
        })?;
        let set = Self::from_lines(&content);
        debug!(
            "loaded {} IPv4 and {} IPv6 prefixes from {}",
            set.v4.len(),
            set.v6.len(),
            path.display()
        );
        Ok(set)
    }

    /// Parse prefix lines from memory. An unterminated final line is fine;
    /// a line with an unparseable address or length is dropped so a garbled
    /// length can never turn into an accidental match-everything `/0`.
    pub fn from_lines(content: &str) -> Self {
        let mut v4 = Vec::new();
        let mut v6 = Vec::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.parse::<IpNetwork>() {
                Ok(IpNetwork::V4(net)) => {
                    v4.push(Prefix::<V4>::new(net.network().to_bits(), net.prefix()));
                }
                Ok(IpNetwork::V6(net)) => {
                    v6.push(Prefix::<V6>::new(net.network().to_bits(), net.prefix()));
                }
                Err(_) => {
                    debug!("skipping unparseable prefix line: {:?}", line);
                }
            }
        }

        Self {
            v4: PrefixTable::new(v4),
            v6: PrefixTable::new(v6),
        }
    }

    /// Containment test across both families.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(_) => self.v4.contains(addr).is_some(),
            IpAddr::V6(_) => self.v6.contains(addr).is_some(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }
}
