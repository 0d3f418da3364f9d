// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Anonymisation stage behaviour over real capture files.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use pktmask_domain::{AnonymizationMethod, IpMapBuilder, StageContext, StageService};

use pktmask::infrastructure::stages::AnonymizeStage;

use crate::common::{assert_checksums_valid, read_pcap, tcp_frame, write_pcap, IP_OFFSET};

const SEED: [u8; 32] = [42u8; 32];

fn context_for(addrs: &[Ipv4Addr]) -> StageContext {
    let mut builder = IpMapBuilder::with_seed(AnonymizationMethod::PrefixPreserving, 24, 64, SEED);
    for a in addrs {
        builder.observe(IpAddr::V4(*a));
    }
    let mut ctx = StageContext::new();
    ctx.set_ip_map(Arc::new(builder.build()));
    ctx
}

fn src_of(frame: &[u8]) -> Ipv4Addr {
    let b: [u8; 4] = frame[IP_OFFSET + 12..IP_OFFSET + 16].try_into().unwrap();
    Ipv4Addr::from(b)
}

fn dst_of(frame: &[u8]) -> Ipv4Addr {
    let b: [u8; 4] = frame[IP_OFFSET + 16..IP_OFFSET + 20].try_into().unwrap();
    Ipv4Addr::from(b)
}

#[test]
fn rewrites_are_consistent_and_prefix_preserving() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.pcap");
    let output = dir.path().join("out.pcap");

    let a = Ipv4Addr::new(192, 168, 1, 1);
    let b = Ipv4Addr::new(192, 168, 1, 2);
    let frames = vec![
        tcp_frame(a, b, 50_000, 443, 1, b"first"),
        tcp_frame(a, b, 50_000, 443, 6, b"second"),
    ];
    write_pcap(&input, &frames);

    let stage = AnonymizeStage::new();
    let mut ctx = context_for(&[a, b]);
    let stats = stage.process_capture(&input, &output, &mut ctx).unwrap();

    assert_eq!(stats.packets_processed, 2);
    assert_eq!(stats.packets_modified, 2);
    assert_eq!(stats.extra_u64("unique_addresses_seen"), Some(2));

    let packets = read_pcap(&output);
    assert_eq!(packets.len(), 2);

    // Both packets carry the same source pseudonym.
    let s0 = src_of(&packets[0].data);
    let s1 = src_of(&packets[1].data);
    assert_eq!(s0, s1);
    assert_ne!(s0, a, "address must actually change");

    // Source and destination shared a /24 and still do.
    let d0 = dst_of(&packets[0].data);
    assert_eq!(u32::from(s0) >> 8, u32::from(d0) >> 8);
    assert_ne!(s0, d0);

    for (packet, original) in packets.iter().zip(&frames) {
        // On-wire length unchanged; checksums repaired.
        assert_eq!(packet.data.len(), original.len());
        assert_checksums_valid(&packet.data);
        // Payload bytes untouched by anonymisation.
        assert_eq!(&packet.data[54..], &original[54..]);
    }
}

#[test]
fn anonymization_is_idempotent_on_own_output() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.pcap");
    let once = dir.path().join("once.pcap");
    let twice = dir.path().join("twice.pcap");

    let a = Ipv4Addr::new(10, 1, 2, 3);
    let b = Ipv4Addr::new(10, 1, 2, 4);
    write_pcap(&input, &[tcp_frame(a, b, 1234, 443, 9, b"payload")]);

    let stage = AnonymizeStage::new();
    let mut ctx = context_for(&[a, b]);
    stage.process_capture(&input, &once, &mut ctx).unwrap();

    // Second pass over the already-pseudonymised output: the pseudonyms
    // are not in the map, so nothing changes.
    let packets_once = read_pcap(&once);
    let stats = stage.process_capture(&once, &twice, &mut ctx).unwrap();
    assert_eq!(stats.packets_modified, 0);
    let packets_twice = read_pcap(&twice);
    assert_eq!(packets_once[0].data, packets_twice[0].data);
}

#[test]
fn non_ip_packets_pass_through_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.pcap");
    let output = dir.path().join("out.pcap");

    // An ARP frame.
    let mut arp = vec![0xffu8; 12];
    arp.extend_from_slice(&[0x08, 0x06]);
    arp.extend_from_slice(&[0u8; 28]);
    write_pcap(&input, &[arp.clone()]);

    let stage = AnonymizeStage::new();
    let mut ctx = context_for(&[]);
    let stats = stage.process_capture(&input, &output, &mut ctx).unwrap();
    assert_eq!(stats.packets_modified, 0);
    assert_eq!(stats.extra_u64("packets_skipped"), Some(1));
    assert_eq!(read_pcap(&output)[0].data, arp);
}

#[test]
fn special_addresses_stay_put() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.pcap");
    let output = dir.path().join("out.pcap");

    let src = Ipv4Addr::new(10, 0, 0, 9);
    let bcast = Ipv4Addr::BROADCAST;
    write_pcap(&input, &[tcp_frame(src, bcast, 68, 67, 0, b"x")]);

    let stage = AnonymizeStage::new();
    let mut ctx = context_for(&[src, bcast]);
    stage.process_capture(&input, &output, &mut ctx).unwrap();

    let packets = read_pcap(&output);
    assert_ne!(src_of(&packets[0].data), src);
    assert_eq!(dst_of(&packets[0].data), bcast);
}

#[test]
fn timestamps_survive_the_stage() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.pcap");
    let output = dir.path().join("out.pcap");

    let a = Ipv4Addr::new(172, 16, 0, 1);
    let b = Ipv4Addr::new(172, 16, 0, 2);
    write_pcap(&input, &[tcp_frame(a, b, 5, 6, 0, b"t")]);

    let stage = AnonymizeStage::new();
    let mut ctx = context_for(&[a, b]);
    stage.process_capture(&input, &output, &mut ctx).unwrap();

    assert_eq!(read_pcap(&input)[0].timestamp, read_pcap(&output)[0].timestamp);
}
