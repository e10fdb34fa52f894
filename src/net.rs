//! CIDR prefix plumbing: parsing, splitting, distance, and address sampling.
//!
//! Everything here works on [`ipnet::IpNet`] in canonical masked form
//! (`trunc()`): only the leading `prefix_len` bits are significant. The rest
//! of the crate relies on that canonicalization for map keys and equality.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use ipnet::IpNet;
use rand::Rng;
use thiserror::Error;

/// Errors from CIDR parsing and prefix splitting.
#[derive(Debug, Error)]
pub enum CidrError {
    /// A string did not parse as `addr/len`.
    #[error("invalid CIDR {input:?}: {source}")]
    Parse {
        input: String,
        #[source]
        source: ipnet::AddrParseError,
    },
    /// Splitting would push the prefix past its family maximum (32 or 128).
    #[error("cannot split {prefix} by {step} bits: exceeds the /{max} family maximum")]
    SplitOverflow { prefix: IpNet, step: u8, max: u8 },
    /// A CIDR file could not be read.
    #[error("failed to read CIDR file {path:?}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Parse a list of CIDR strings into masked prefixes.
///
/// Input strings are trimmed; the order is preserved. Duplicates are kept —
/// callers that need a canonical set should follow up with [`dedup_masked`].
pub fn parse_cidrs(items: &[String]) -> Result<Vec<IpNet>, CidrError> {
    let mut out = Vec::with_capacity(items.len());
    for raw in items {
        let s = raw.trim();
        let net: IpNet = s.parse().map_err(|source| CidrError::Parse {
            input: s.to_string(),
            source,
        })?;
        out.push(net.trunc());
    }
    Ok(out)
}

/// Read CIDRs from a file: one per line, blank lines and `#` comments skipped.
pub fn read_cidrs_from_file(path: &Path) -> Result<Vec<IpNet>, CidrError> {
    let text = std::fs::read_to_string(path).map_err(|source| CidrError::File {
        path: path.to_path_buf(),
        source,
    })?;
    let lines: Vec<String> = text
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect();
    parse_cidrs(&lines)
}

/// Mask and deduplicate prefixes, preserving first-seen order.
pub fn dedup_masked(prefixes: Vec<IpNet>) -> Vec<IpNet> {
    let mut seen: HashSet<IpNet> = HashSet::with_capacity(prefixes.len());
    let mut out = Vec::with_capacity(prefixes.len());
    for p in prefixes {
        let p = p.trunc();
        if seen.insert(p) {
            out.push(p);
        }
    }
    out
}

/// Split a prefix into `2^step` disjoint children that cover it exactly.
///
/// Fails when `prefix_len + step` exceeds the family maximum.
pub fn split_prefix(prefix: IpNet, step: u8) -> Result<Vec<IpNet>, CidrError> {
    let p = prefix.trunc();
    let max = p.max_prefix_len();
    let overflow = CidrError::SplitOverflow {
        prefix: p,
        step,
        max,
    };
    let new_len = match p.prefix_len().checked_add(step) {
        Some(n) if n <= max => n,
        _ => return Err(overflow),
    };
    let children = p.subnets(new_len).map_err(|_| overflow)?;
    Ok(children.collect())
}

/// Distance between two prefixes: `min_bits − common_prefix_bits`.
///
/// `0` means identical network bits up to the shorter prefix; prefixes of
/// different address families are maximally distant (`128`).
pub fn prefix_distance(a: IpNet, b: IpNet) -> u32 {
    let min_bits = u32::from(a.prefix_len().min(b.prefix_len()));
    let common = match (a, b) {
        (IpNet::V4(a4), IpNet::V4(b4)) => {
            let xor = u32::from(a4.network()) ^ u32::from(b4.network());
            xor.leading_zeros().min(min_bits)
        }
        (IpNet::V6(a6), IpNet::V6(b6)) => {
            let xor = u128::from(a6.network()) ^ u128::from(b6.network());
            xor.leading_zeros().min(min_bits)
        }
        _ => return 128,
    };
    min_bits - common
}

/// Draw a uniform random address inside `prefix`: network bits fixed, host
/// bits filled from `rng`. A /32 (v4) or /128 (v6) returns the exact address.
pub(crate) fn random_addr_in<R: Rng>(prefix: IpNet, rng: &mut R) -> IpAddr {
    match prefix.trunc() {
        IpNet::V4(p) => {
            let host_bits = 32 - u32::from(p.prefix_len());
            if host_bits == 0 {
                return IpAddr::V4(p.network());
            }
            let mask = if host_bits >= 32 {
                u32::MAX
            } else {
                (1u32 << host_bits) - 1
            };
            let base = u32::from(p.network());
            IpAddr::V4(Ipv4Addr::from(base | (rng.random::<u32>() & mask)))
        }
        IpNet::V6(p) => {
            let host_bits = 128 - u32::from(p.prefix_len());
            if host_bits == 0 {
                return IpAddr::V6(p.network());
            }
            let mask = if host_bits >= 128 {
                u128::MAX
            } else {
                (1u128 << host_bits) - 1
            };
            let base = u128::from(p.network());
            IpAddr::V6(Ipv6Addr::from(base | (rng.random::<u128>() & mask)))
        }
    }
}
