// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # IP Pseudonym Map
//!
//! The directory-scoped table mapping every observed IP address to its
//! pseudonym. The map is built once, from the sorted union of addresses
//! collected by the controller's pre-scan, and is read-only afterwards -
//! which is what makes it safely shareable across file workers and what
//! guarantees cross-file consistency: within one run the same original
//! always resolves to the same pseudonym.
//!
//! ## Strategies
//!
//! - **Prefix-preserving** (default): originals sharing a network prefix
//!   share a pseudonym prefix. The preserved prefix width is configurable
//!   (IPv4 default /24, IPv6 default /64). Prefixes and host parts are both
//!   allocated from a keyed hash with linear probing, so the structure of
//!   the trace survives while the concrete values do not.
//! - **Random**: a seeded random bijection with no prefix correlation.
//! - **Hash**: keyed SHA-256 of the address truncated to the address width,
//!   probed on collision.
//!
//! All three are deterministic for a fixed seed and input set; the builder
//! draws a fresh seed per run unless one is injected (tests inject).
//!
//! ## Special addresses
//!
//! Multicast, limited-broadcast, loopback and unspecified addresses map to
//! themselves. Rewriting them would break the protocol semantics the
//! sanitised trace is meant to preserve, and they identify no host.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::PktMaskError;

/// The recognised pseudonymisation strategies.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnonymizationMethod {
    #[default]
    PrefixPreserving,
    Random,
    Hash,
}

impl AnonymizationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnonymizationMethod::PrefixPreserving => "prefix_preserving",
            AnonymizationMethod::Random => "random",
            AnonymizationMethod::Hash => "hash",
        }
    }

    pub fn parse(s: &str) -> Result<Self, PktMaskError> {
        match s {
            "prefix_preserving" => Ok(Self::PrefixPreserving),
            "random" => Ok(Self::Random),
            "hash" => Ok(Self::Hash),
            other => Err(PktMaskError::invalid_config(format!(
                "unknown anonymization method '{}' (expected prefix_preserving, random, or hash)",
                other
            ))),
        }
    }
}

fn v4_special(a: Ipv4Addr) -> bool {
    a.is_loopback() || a.is_multicast() || a.is_broadcast() || a.is_unspecified()
}

fn v6_special(a: Ipv6Addr) -> bool {
    a.is_loopback() || a.is_multicast() || a.is_unspecified()
}

/// Read-only pseudonym table. Construct with [`IpMapBuilder`].
#[derive(Debug, Clone, Default)]
pub struct IpMap {
    v4: HashMap<Ipv4Addr, Ipv4Addr>,
    v6: HashMap<Ipv6Addr, Ipv6Addr>,
    method: AnonymizationMethod,
    identity_mapped: u64,
}

impl IpMap {
    pub fn lookup_v4(&self, addr: Ipv4Addr) -> Option<Ipv4Addr> {
        self.v4.get(&addr).copied()
    }

    pub fn lookup_v6(&self, addr: Ipv6Addr) -> Option<Ipv6Addr> {
        self.v6.get(&addr).copied()
    }

    pub fn lookup(&self, addr: IpAddr) -> Option<IpAddr> {
        match addr {
            IpAddr::V4(a) => self.lookup_v4(a).map(IpAddr::V4),
            IpAddr::V6(a) => self.lookup_v6(a).map(IpAddr::V6),
        }
    }

    /// Total mapped addresses (both families).
    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    pub fn method(&self) -> AnonymizationMethod {
        self.method
    }

    /// Addresses mapped to themselves (special-use).
    pub fn identity_mapped(&self) -> u64 {
        self.identity_mapped
    }
}

/// Accumulates the address universe from the pre-scan and materialises the
/// pseudonym table.
#[derive(Debug, Clone)]
pub struct IpMapBuilder {
    method: AnonymizationMethod,
    ipv4_prefix: u8,
    ipv6_prefix: u8,
    seed: [u8; 32],
    v4: BTreeSet<Ipv4Addr>,
    v6: BTreeSet<Ipv6Addr>,
}

impl IpMapBuilder {
    /// Creates a builder with a per-run random seed.
    pub fn new(method: AnonymizationMethod, ipv4_prefix: u8, ipv6_prefix: u8) -> Self {
        use rand::Rng;
        let seed: [u8; 32] = rand::rng().random();
        Self::with_seed(method, ipv4_prefix, ipv6_prefix, seed)
    }

    /// Creates a builder with an explicit seed (deterministic output).
    pub fn with_seed(method: AnonymizationMethod, ipv4_prefix: u8, ipv6_prefix: u8, seed: [u8; 32]) -> Self {
        Self {
            method,
            ipv4_prefix,
            ipv6_prefix,
            seed,
            v4: BTreeSet::new(),
            v6: BTreeSet::new(),
        }
    }

    /// Records an observed address.
    pub fn observe(&mut self, addr: IpAddr) {
        match addr {
            IpAddr::V4(a) => {
                self.v4.insert(a);
            }
            IpAddr::V6(a) => {
                self.v6.insert(a);
            }
        }
    }

    pub fn observe_all<I: IntoIterator<Item = IpAddr>>(&mut self, addrs: I) {
        for a in addrs {
            self.observe(a);
        }
    }

    /// Unique addresses observed so far.
    pub fn observed(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    fn keyed_hash(&self, tag: &[u8], bytes: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.seed);
        hasher.update(tag);
        hasher.update(bytes);
        hasher.finalize().into()
    }

    fn hash_u32(&self, tag: &[u8], bytes: &[u8]) -> u32 {
        let h = self.keyed_hash(tag, bytes);
        u32::from_be_bytes([h[0], h[1], h[2], h[3]])
    }

    fn hash_u128(&self, tag: &[u8], bytes: &[u8]) -> u128 {
        let h = self.keyed_hash(tag, bytes);
        let mut b = [0u8; 16];
        b.copy_from_slice(&h[..16]);
        u128::from_be_bytes(b)
    }

    /// Materialises the pseudonym table. Iteration is over sorted address
    /// sets, so the result depends only on the seed and the observed
    /// universe, never on observation order.
    pub fn build(self) -> IpMap {
        let mut map = IpMap {
            method: self.method,
            ..IpMap::default()
        };

        self.build_v4(&mut map);
        self.build_v6(&mut map);
        map
    }

    fn build_v4(&self, map: &mut IpMap) {
        let host_bits = 32 - u32::from(self.ipv4_prefix);
        let mut used: HashSet<Ipv4Addr> = HashSet::new();
        // Special addresses claim themselves before any allocation.
        for &addr in self.v4.iter().filter(|a| v4_special(**a)) {
            used.insert(addr);
            map.v4.insert(addr, addr);
            map.identity_mapped += 1;
        }
        let mut prefix_map: HashMap<u32, u32> = HashMap::new();
        let mut used_prefixes: HashSet<u32> = HashSet::new();

        for &addr in self.v4.iter().filter(|a| !v4_special(**a)) {
            let raw = u32::from(addr);
            let pseudo = match self.method {
                AnonymizationMethod::PrefixPreserving => {
                    let prefix = raw >> host_bits;
                    let mapped_prefix = *prefix_map.entry(prefix).or_insert_with(|| {
                        let span = 1u32 << self.ipv4_prefix;
                        let mut candidate = self.hash_u32(b"v4-prefix", &prefix.to_be_bytes()) % span;
                        while used_prefixes.contains(&candidate)
                            || v4_special(Ipv4Addr::from(candidate << host_bits))
                        {
                            candidate = (candidate + 1) % span;
                        }
                        used_prefixes.insert(candidate);
                        candidate
                    });
                    let host_span = 1u64 << host_bits;
                    let mut host =
                        u64::from(self.hash_u32(b"v4-host", &raw.to_be_bytes())) % host_span;
                    let make = |h: u64| Ipv4Addr::from((mapped_prefix << host_bits) | h as u32);
                    while used.contains(&make(host)) {
                        host = (host + 1) % host_span;
                    }
                    make(host)
                }
                AnonymizationMethod::Random | AnonymizationMethod::Hash => {
                    // Both draw from the keyed hash; `random` mixes the raw
                    // value through a second round so no prefix correlation
                    // survives, `hash` is the plain truncated digest.
                    let tag: &[u8] = if self.method == AnonymizationMethod::Random {
                        b"v4-random"
                    } else {
                        b"v4-hash"
                    };
                    let mut candidate = self.hash_u32(tag, &raw.to_be_bytes());
                    while used.contains(&Ipv4Addr::from(candidate))
                        || v4_special(Ipv4Addr::from(candidate))
                    {
                        candidate = candidate.wrapping_add(1);
                    }
                    Ipv4Addr::from(candidate)
                }
            };
            used.insert(pseudo);
            map.v4.insert(addr, pseudo);
        }
    }

    fn build_v6(&self, map: &mut IpMap) {
        let host_bits = 128 - u32::from(self.ipv6_prefix);
        let mut used: HashSet<Ipv6Addr> = HashSet::new();
        for &addr in self.v6.iter().filter(|a| v6_special(**a)) {
            used.insert(addr);
            map.v6.insert(addr, addr);
            map.identity_mapped += 1;
        }
        let mut prefix_map: HashMap<u128, u128> = HashMap::new();
        let mut used_prefixes: HashSet<u128> = HashSet::new();

        for &addr in self.v6.iter().filter(|a| !v6_special(**a)) {
            let raw = u128::from(addr);
            let pseudo = match self.method {
                AnonymizationMethod::PrefixPreserving => {
                    let prefix = raw >> host_bits;
                    let prefix_span = if self.ipv6_prefix >= 128 {
                        u128::MAX
                    } else {
                        1u128 << self.ipv6_prefix
                    };
                    let mapped_prefix = *prefix_map.entry(prefix).or_insert_with(|| {
                        let mut candidate =
                            self.hash_u128(b"v6-prefix", &prefix.to_be_bytes()) % prefix_span;
                        while used_prefixes.contains(&candidate)
                            || v6_special(Ipv6Addr::from(candidate << host_bits))
                        {
                            candidate = candidate.wrapping_add(1) % prefix_span;
                        }
                        used_prefixes.insert(candidate);
                        candidate
                    });
                    let host_mask = if host_bits >= 128 {
                        u128::MAX
                    } else {
                        (1u128 << host_bits) - 1
                    };
                    let mut host = self.hash_u128(b"v6-host", &raw.to_be_bytes()) & host_mask;
                    let make = |h: u128| Ipv6Addr::from((mapped_prefix << host_bits) | h);
                    while used.contains(&make(host)) {
                        host = host.wrapping_add(1) & host_mask;
                    }
                    make(host)
                }
                AnonymizationMethod::Random | AnonymizationMethod::Hash => {
                    let tag: &[u8] = if self.method == AnonymizationMethod::Random {
                        b"v6-random"
                    } else {
                        b"v6-hash"
                    };
                    let mut candidate = self.hash_u128(tag, &raw.to_be_bytes());
                    while used.contains(&Ipv6Addr::from(candidate))
                        || v6_special(Ipv6Addr::from(candidate))
                    {
                        candidate = candidate.wrapping_add(1);
                    }
                    Ipv6Addr::from(candidate)
                }
            };
            used.insert(pseudo);
            map.v6.insert(addr, pseudo);
        }
    }
}
