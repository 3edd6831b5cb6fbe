//! Country prefix source and IPv4 network set arithmetic.
//!
//! The engine asks the source once per country rule at startup; where the
//! data comes from is pluggable behind [`PrefixSource`]. The shipped
//! implementation reads a YAML map of country code to network entries, each
//! either a CIDR (`192.0.2.0/24`) or an inclusive range
//! (`1.0.0.0-1.0.0.255`). Refreshing the seed data is an external concern.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use cidr::{Ipv4Cidr, Ipv4Inet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("prefix file not found: {0}")]
    NoFile(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid network `{0}`")]
    BadNetwork(String),
    #[error("invalid address range `{0}`")]
    BadRange(String),
}

/// Supplies the collapsed IPv4 network set of a country code.
pub trait PrefixSource {
    /// An unknown country yields an empty set, not an error.
    fn prefixes(&self, country: &str) -> Result<Vec<Ipv4Cidr>, Error>;
}

/// Parses a CIDR or bare address; host bits beyond the prefix are masked off.
pub fn parse_net(raw: &str) -> Result<Ipv4Cidr, Error> {
    let raw = raw.trim();
    match raw.split_once('/') {
        Some((addr, len)) => {
            let addr: Ipv4Addr = addr.parse().map_err(|_| Error::BadNetwork(raw.to_string()))?;
            let len: u8 = len.parse().map_err(|_| Error::BadNetwork(raw.to_string()))?;
            let inet = Ipv4Inet::new(addr, len).map_err(|_| Error::BadNetwork(raw.to_string()))?;
            Ok(inet.network())
        }
        None => {
            let addr: Ipv4Addr = raw.parse().map_err(|_| Error::BadNetwork(raw.to_string()))?;
            Ok(Ipv4Cidr::new_host(addr))
        }
    }
}

/// Summarizes an inclusive address range into the minimal list of CIDRs.
pub fn summarize_range(start: Ipv4Addr, end: Ipv4Addr) -> Vec<Ipv4Cidr> {
    let mut out = Vec::new();
    let mut cur = u64::from(u32::from(start));
    let end = u64::from(u32::from(end));
    while cur <= end {
        let align = cur.trailing_zeros().min(32);
        let span_bits = (end - cur + 1).ilog2();
        let block = align.min(span_bits);
        if let Ok(cidr) = Ipv4Cidr::new(Ipv4Addr::from(cur as u32), (32 - block) as u8) {
            out.push(cidr);
        }
        cur += 1u64 << block;
    }
    out
}

/// Collapses a network set: overlapping and adjacent blocks merge, the
/// result is the minimal sorted CIDR list covering the same addresses.
pub fn collapse(nets: Vec<Ipv4Cidr>) -> Vec<Ipv4Cidr> {
    let mut ranges: Vec<(u64, u64)> = nets
        .iter()
        .map(|net| {
            (
                u64::from(u32::from(net.first_address())),
                u64::from(u32::from(net.last_address())),
            )
        })
        .collect();
    ranges.sort_unstable();

    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
    for (start, end) in ranges {
        match merged.last_mut() {
            Some((_, last_end)) if start <= *last_end + 1 => *last_end = (*last_end).max(end),
            _ => merged.push((start, end)),
        }
    }

    merged
        .into_iter()
        .flat_map(|(start, end)| {
            summarize_range(Ipv4Addr::from(start as u32), Ipv4Addr::from(end as u32))
        })
        .collect()
}

/// YAML-backed prefix source; parsed and collapsed once on load.
pub struct FilePrefixSource {
    map: HashMap<String, Vec<Ipv4Cidr>>,
}

impl FilePrefixSource {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NoFile(path.to_path_buf())
            } else {
                Error::Io(e)
            }
        })?;
        let raw: HashMap<String, Vec<String>> = serde_yaml::from_str(&content)?;

        let mut map = HashMap::with_capacity(raw.len());
        for (country, entries) in raw {
            let mut nets = Vec::with_capacity(entries.len());
            for entry in &entries {
                nets.extend(parse_entry(entry)?);
            }
            map.insert(country.to_ascii_uppercase(), collapse(nets));
        }
        Ok(Self { map })
    }
}

fn parse_entry(entry: &str) -> Result<Vec<Ipv4Cidr>, Error> {
    match entry.split_once('-') {
        Some((start, end)) => {
            let start: Ipv4Addr = start
                .trim()
                .parse()
                .map_err(|_| Error::BadRange(entry.to_string()))?;
            let end: Ipv4Addr = end
                .trim()
                .parse()
                .map_err(|_| Error::BadRange(entry.to_string()))?;
            if u32::from(start) > u32::from(end) {
                return Err(Error::BadRange(entry.to_string()));
            }
            Ok(summarize_range(start, end))
        }
        None => Ok(vec![parse_net(entry)?]),
    }
}

impl PrefixSource for FilePrefixSource {
    fn prefixes(&self, country: &str) -> Result<Vec<Ipv4Cidr>, Error> {
        match self.map.get(&country.to_ascii_uppercase()) {
            Some(nets) => Ok(nets.clone()),
            None => {
                tracing::warn!(country, "no prefixes for country");
                Ok(Vec::new())
            }
        }
    }
}

/// In-memory source for tests and embedders.
#[derive(Debug, Default)]
pub struct StaticPrefixes(pub HashMap<String, Vec<Ipv4Cidr>>);

impl PrefixSource for StaticPrefixes {
    fn prefixes(&self, country: &str) -> Result<Vec<Ipv4Cidr>, Error> {
        Ok(self.0.get(country).cloned().unwrap_or_default())
    }
}
