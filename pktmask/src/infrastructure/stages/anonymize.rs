// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # IP Anonymisation Stage
//!
//! Rewrites every IP address in every layer the decapsulation walk can
//! reach - outer and inner headers through VLAN/MPLS/GRE/VXLAN/GENEVE, and
//! the IP headers embedded in ICMP error payloads - using the
//! directory-scoped pseudonym map, then repairs every checksum the rewrite
//! invalidated: IPv4 header checksums, TCP/UDP checksums over the
//! pseudo-header, non-zero tunnel UDP checksums, GRE checksums, and ICMP
//! checksums. Packet length and order are untouched.
//!
//! Checksums are repaired innermost-first: an outer UDP or GRE checksum
//! covers the inner headers, so the inner values must be final before the
//! outer sum is taken.
//!
//! Packets whose walk stopped at an unrecognised encapsulation keep the
//! rewrites of the layers that *were* found; the stop is counted as a
//! skip and the packet continues downstream, per the stage contract.
//!
//! This module also hosts the directory pre-scan: one pass over every
//! input file (rayon-parallel) collecting the address universe the
//! [`IpMapBuilder`] turns into the shared map.

use etherparse::Ipv4HeaderSlice;
use rayon::prelude::*;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Instant;

use pktmask_domain::{IpMap, IpMapBuilder, PktMaskError, StageContext, StageService, StageStats};

use crate::infrastructure::codec::checksum;
use crate::infrastructure::codec::layers::{self, IcmpLayer, L4, LinkKind, PacketLayers};
use crate::infrastructure::codec::reader::{CaptureFormat, CaptureReader};
use crate::infrastructure::codec::writer::CaptureWriter;

/// ICMPv4 types whose payload embeds the offending IP header.
const ICMP4_EMBEDDED_TYPES: [u8; 5] = [3, 4, 5, 11, 12];
/// ICMPv6 error types (RFC 4443 §2.1: types < 128 with embedded packet).
const ICMP6_EMBEDDED_TYPES: [u8; 4] = [1, 2, 3, 4];

/// Address-rewriting stage backed by the shared [`IpMap`].
#[derive(Default)]
pub struct AnonymizeStage;

impl AnonymizeStage {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Default)]
struct RewriteCounters {
    addresses_rewritten: u64,
    addresses_unmapped: u64,
    packets_skipped: u64,
}

impl StageService for AnonymizeStage {
    fn name(&self) -> &'static str {
        "anonymize_ips"
    }

    fn process_capture(
        &self,
        input: &Path,
        output: &Path,
        ctx: &mut StageContext,
    ) -> Result<StageStats, PktMaskError> {
        let started = Instant::now();
        let map = ctx
            .ip_map()
            .cloned()
            .ok_or_else(|| PktMaskError::internal_error("anonymize stage scheduled without an IP map"))?;

        let mut stats = StageStats::new(self.name());
        let mut reader = CaptureReader::open(input)?;
        let mut writer: Option<CaptureWriter> = None;
        let mut counters = RewriteCounters::default();
        let mut seen_addresses: HashSet<IpAddr> = HashSet::new();

        while let Some(packet) = reader.next_packet() {
            ctx.check_cancelled()?;
            let mut packet = packet?;
            stats.packets_processed += 1;

            let link = LinkKind::from_link_type(u32::from(reader.link_type()));
            let modified = match link {
                Some(link) => {
                    let parsed = layers::parse_packet(&packet.data, link);
                    if parsed.stopped.is_some() {
                        counters.packets_skipped += 1;
                    }
                    for addr in packet_addresses(&packet.data, &parsed) {
                        seen_addresses.insert(addr);
                    }
                    rewrite_packet(&mut packet.data, &parsed, &map, &mut counters)
                }
                None => {
                    counters.packets_skipped += 1;
                    false
                }
            };
            if modified {
                stats.packets_modified += 1;
            }

            let writer = CaptureWriter::ensure(
                &mut writer,
                output,
                reader.link_type(),
                reader.ts_resolution(),
            )?;
            writer.write_packet(&packet)?;
        }

        let writer = match writer {
            Some(w) => w,
            None => CaptureWriter::create(output, reader.link_type(), reader.ts_resolution())?,
        };
        writer.finish()?;

        stats.set_extra("unique_addresses_seen", seen_addresses.len());
        stats.set_extra("addresses_rewritten", counters.addresses_rewritten);
        stats.set_extra("addresses_unmapped", counters.addresses_unmapped);
        stats.set_extra("packets_skipped", counters.packets_skipped);
        if reader.format() == CaptureFormat::PcapNg {
            stats.set_extra("converted_to_pcap", true);
        }
        stats.duration = started.elapsed();
        tracing::debug!(
            "anonymize: {} packets, {} modified, {} addresses rewritten",
            stats.packets_processed,
            stats.packets_modified,
            counters.addresses_rewritten
        );
        Ok(stats)
    }
}

/// Every address the packet references: per-layer source/destination plus
/// the addresses inside embedded ICMP error headers. The pre-scan and the
/// rewrite share this so the map always covers what the rewrite will touch.
pub fn packet_addresses(data: &[u8], parsed: &PacketLayers) -> Vec<IpAddr> {
    let mut addrs = Vec::with_capacity(parsed.ip_layers.len() * 2);
    for layer in &parsed.ip_layers {
        addrs.push(layer.src);
        addrs.push(layer.dst);
        if let L4::Icmp(icmp) = &layer.l4 {
            if let Some(embedded) = embedded_header(data, icmp) {
                addrs.push(embedded.src);
                addrs.push(embedded.dst);
            }
        }
    }
    addrs
}

struct EmbeddedHeader {
    src: IpAddr,
    dst: IpAddr,
    /// Frame-absolute offset of the embedded IP header.
    offset: usize,
    is_v6: bool,
    header_len: usize,
}

/// Locates the IP header embedded in an ICMP error payload, if this ICMP
/// message is an error type and the header is fully captured.
fn embedded_header(data: &[u8], icmp: &IcmpLayer) -> Option<EmbeddedHeader> {
    let icmp_type = *data.get(icmp.offset)?;
    let embedded_at = icmp.offset + 8;
    if icmp.is_v6 {
        if !ICMP6_EMBEDDED_TYPES.contains(&icmp_type) {
            return None;
        }
        let header = data.get(embedded_at..embedded_at + 40)?;
        let src: [u8; 16] = header[8..24].try_into().ok()?;
        let dst: [u8; 16] = header[24..40].try_into().ok()?;
        Some(EmbeddedHeader {
            src: IpAddr::from(src),
            dst: IpAddr::from(dst),
            offset: embedded_at,
            is_v6: true,
            header_len: 40,
        })
    } else {
        if !ICMP4_EMBEDDED_TYPES.contains(&icmp_type) {
            return None;
        }
        let slice = Ipv4HeaderSlice::from_slice(data.get(embedded_at..)?).ok()?;
        Some(EmbeddedHeader {
            src: IpAddr::V4(slice.source_addr()),
            dst: IpAddr::V4(slice.destination_addr()),
            offset: embedded_at,
            is_v6: false,
            header_len: usize::from(slice.ihl()) * 4,
        })
    }
}

fn write_addr(data: &mut [u8], offset: usize, addr: IpAddr) {
    match addr {
        IpAddr::V4(a) => data[offset..offset + 4].copy_from_slice(&a.octets()),
        IpAddr::V6(a) => data[offset..offset + 16].copy_from_slice(&a.octets()),
    }
}

/// Applies the pseudonym map to every layer of one packet and repairs the
/// affected checksums. Returns whether any byte changed.
fn rewrite_packet(
    data: &mut [u8],
    parsed: &PacketLayers,
    map: &IpMap,
    counters: &mut RewriteCounters,
) -> bool {
    let mut changed = false;

    for layer in &parsed.ip_layers {
        for (addr, offset) in [(layer.src, layer.src_offset), (layer.dst, layer.dst_offset)] {
            match map.lookup(addr) {
                Some(pseudo) if pseudo != addr => {
                    write_addr(data, offset, pseudo);
                    counters.addresses_rewritten += 1;
                    changed = true;
                }
                Some(_) => {}
                None => counters.addresses_unmapped += 1,
            }
        }

        // ICMP error payloads embed the original header; rewrite it the
        // same way so the error still refers to the pseudonymised host.
        if let L4::Icmp(icmp) = &layer.l4 {
            if let Some(embedded) = embedded_header(data, icmp) {
                for (addr, offset) in [
                    (embedded.src, embedded.offset + if embedded.is_v6 { 8 } else { 12 }),
                    (embedded.dst, embedded.offset + if embedded.is_v6 { 24 } else { 16 }),
                ] {
                    match map.lookup(addr) {
                        Some(pseudo) if pseudo != addr => {
                            write_addr(data, offset, pseudo);
                            counters.addresses_rewritten += 1;
                            changed = true;
                        }
                        Some(_) => {}
                        None => counters.addresses_unmapped += 1,
                    }
                }
                if !embedded.is_v6 && changed {
                    let span = embedded.offset..embedded.offset + embedded.header_len;
                    if span.end <= data.len() {
                        let sum = checksum::ipv4_header(&data[span.clone()]);
                        checksum::put_u16(data, embedded.offset + 10, sum);
                    }
                }
            }
        }
    }

    if changed {
        refresh_checksums(data, parsed);
    }
    changed
}

/// Recomputes every checksum the address rewrite can have invalidated,
/// innermost layer first so outer checksums cover final inner bytes.
fn refresh_checksums(data: &mut [u8], parsed: &PacketLayers) {
    for layer in parsed.ip_layers.iter().rev() {
        if layer.truncated {
            // The wire payload is not fully captured; any checksum we
            // computed would be wrong for the original packet too.
            continue;
        }
        let src = addr_bytes(data, layer.src_offset, layer.is_v6);
        let dst = addr_bytes(data, layer.dst_offset, layer.is_v6);

        match &layer.l4 {
            L4::Tcp(tcp) => {
                let span = tcp.offset..tcp.offset + layer.payload_len;
                if span.end <= data.len() {
                    let pseudo = pseudo_sum(&src, &dst, layers::IPPROTO_TCP, layer.payload_len as u32);
                    let sum = checksum::transport(pseudo, &data[span], tcp.checksum_offset - tcp.offset);
                    checksum::put_u16(data, tcp.checksum_offset, sum);
                }
            }
            L4::Udp(udp) if udp.has_checksum => {
                let span = udp.offset..udp.offset + layer.payload_len;
                if span.end <= data.len() {
                    let pseudo = pseudo_sum(&src, &dst, layers::IPPROTO_UDP, layer.payload_len as u32);
                    let sum = checksum::transport(pseudo, &data[span], udp.checksum_offset - udp.offset);
                    // UDP transmits an all-zero checksum as 0xffff.
                    let sum = if sum == 0 { 0xffff } else { sum };
                    checksum::put_u16(data, udp.checksum_offset, sum);
                }
            }
            L4::Icmp(icmp) => {
                let span = icmp.offset..icmp.offset + icmp.len;
                if span.end <= data.len() {
                    let sum = if icmp.is_v6 {
                        let (src16, dst16) = (to_16(&src), to_16(&dst));
                        checksum::icmp_v6(src16, dst16, &data[span])
                    } else {
                        checksum::icmp_v4(&data[span])
                    };
                    checksum::put_u16(data, icmp.checksum_offset, sum);
                }
            }
            L4::Gre(gre) => {
                if let Some(checksum_offset) = gre.checksum_offset {
                    let span = gre.offset..gre.offset + gre.span_len;
                    if span.end <= data.len() {
                        let sum = checksum::transport(0, &data[span], checksum_offset - gre.offset);
                        checksum::put_u16(data, checksum_offset, sum);
                    }
                }
            }
            _ => {}
        }

        if !layer.is_v6 {
            let span = layer.offset..layer.offset + layer.header_len;
            if span.end <= data.len() {
                let sum = checksum::ipv4_header(&data[span]);
                checksum::put_u16(data, layer.offset + 10, sum);
            }
        }
    }
}

fn addr_bytes(data: &[u8], offset: usize, is_v6: bool) -> Vec<u8> {
    let len = if is_v6 { 16 } else { 4 };
    data[offset..offset + len].to_vec()
}

fn to_16(bytes: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(bytes);
    out
}

fn pseudo_sum(src: &[u8], dst: &[u8], protocol: u8, len: u32) -> u32 {
    if src.len() == 16 {
        checksum::pseudo_v6(to_16(src), to_16(dst), protocol, len)
    } else {
        let mut s = [0u8; 4];
        let mut d = [0u8; 4];
        s.copy_from_slice(src);
        d.copy_from_slice(dst);
        checksum::pseudo_v4(s, d, protocol, len)
    }
}

/// Directory pre-scan: collects the union of addresses across `files` into
/// the builder. Files that cannot be read are logged and skipped here; the
/// per-file pipeline run will surface their errors properly.
pub fn collect_addresses(files: &[PathBuf], builder: &mut IpMapBuilder) -> Result<(), PktMaskError> {
    let sets: Vec<HashSet<IpAddr>> = files
        .par_iter()
        .map(|path| match scan_file(path) {
            Ok(set) => set,
            Err(e) => {
                tracing::warn!("pre-scan skipping {}: {}", path.display(), e);
                HashSet::new()
            }
        })
        .collect();
    for set in sets {
        builder.observe_all(set);
    }
    Ok(())
}

fn scan_file(path: &Path) -> Result<HashSet<IpAddr>, PktMaskError> {
    let mut reader = CaptureReader::open(path)?;
    let mut set = HashSet::new();
    while let Some(packet) = reader.next_packet() {
        let packet = packet?;
        if let Some(link) = LinkKind::from_link_type(u32::from(reader.link_type())) {
            let parsed = layers::parse_packet(&packet.data, link);
            set.extend(packet_addresses(&packet.data, &parsed));
        }
    }
    Ok(set)
}
