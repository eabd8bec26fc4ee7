use std::{collections::HashMap, net::IpAddr};

use anyhow::{anyhow, Result};

/// Maps a client address to a cloud region tag.
///
/// The prefix table is built once at startup; lookups are synchronous and
/// allocation-free since they run on every public s3 get.
pub struct RegionResolver {
    entries: Vec<CidrEntry>,
}

struct CidrEntry {
    network: u128,
    mask: u128,
    v4: bool,
    prefix: u8,
    region: String,
}

impl RegionResolver {
    /// `regions` maps a region tag to the CIDR blocks announced for it.
    pub fn new(regions: &HashMap<String, Vec<String>>) -> Result<Self> {
        let mut entries = Vec::new();
        for (region, cidrs) in regions {
            for cidr in cidrs {
                entries.push(parse_cidr(region, cidr)?);
            }
        }
        // Longest prefix first so the most specific block wins.
        entries.sort_by(|a, b| b.prefix.cmp(&a.prefix));
        Ok(RegionResolver { entries })
    }

    pub fn region_of(&self, ip: IpAddr) -> Option<&str> {
        let (bits, v4) = ip_bits(ip);
        self.entries
            .iter()
            .find(|entry| entry.v4 == v4 && bits & entry.mask == entry.network)
            .map(|entry| entry.region.as_str())
    }
}

fn parse_cidr(region: &str, cidr: &str) -> Result<CidrEntry> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| anyhow!("invalid cidr block {cidr} for region {region}"))?;
    let addr: IpAddr = addr
        .parse()
        .map_err(|e| anyhow!("invalid address in cidr block {cidr}: {e}"))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|e| anyhow!("invalid prefix length in cidr block {cidr}: {e}"))?;
    let (bits, v4) = ip_bits(addr);
    let width: u8 = if v4 { 32 } else { 128 };
    if prefix > width {
        return Err(anyhow!("prefix length {prefix} out of range in {cidr}"));
    }
    let mask = if prefix == 0 {
        0
    } else {
        (u128::MAX << (128 - prefix as u32)) >> (128 - width as u32)
    };
    Ok(CidrEntry {
        network: bits & mask,
        mask,
        v4,
        prefix,
        region: region.to_string(),
    })
}

fn ip_bits(ip: IpAddr) -> (u128, bool) {
    match ip {
        IpAddr::V4(v4) => (u32::from(v4) as u128, true),
        IpAddr::V6(v6) => (u128::from(v6), false),
    }
}
