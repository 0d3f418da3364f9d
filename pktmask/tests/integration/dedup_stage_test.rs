// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Deduplication stage behaviour over real capture files.

use std::net::Ipv4Addr;

use pktmask_domain::{StageContext, StageService};

use pktmask::infrastructure::stages::DedupStage;

use crate::common::{read_pcap, tcp_frame, write_pcap};

fn unique_frame(i: u8) -> Vec<u8> {
    tcp_frame(
        Ipv4Addr::new(10, 0, 0, 1),
        Ipv4Addr::new(10, 0, 0, 2),
        40_000 + u16::from(i),
        80,
        1000 + u32::from(i),
        &[i; 16],
    )
}

#[test]
fn duplicates_dropped_uniques_kept_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.pcap");
    let output = dir.path().join("out.pcap");

    // 20 unique packets with 10 copies of one duplicate frame sprinkled in.
    let dup = unique_frame(99);
    let mut frames: Vec<Vec<u8>> = Vec::new();
    frames.push(dup.clone());
    for i in 0..20 {
        frames.push(unique_frame(i));
        if i < 9 {
            frames.push(dup.clone());
        }
    }
    assert_eq!(frames.len(), 30);
    write_pcap(&input, &frames);

    let stage = DedupStage::new();
    let mut ctx = StageContext::new();
    let stats = stage.process_capture(&input, &output, &mut ctx).unwrap();

    assert_eq!(stats.packets_processed, 30);
    assert_eq!(stats.extra_u64("packets_dropped"), Some(9));
    assert_eq!(stats.packets_modified, 0, "dedup never modifies bytes");

    let packets = read_pcap(&output);
    assert_eq!(packets.len(), 21);
    // First occurrence of the duplicate survives at its original position.
    assert_eq!(packets[0].data, dup);
    // Kept packets are byte-identical to their inputs, in input order.
    for (i, packet) in packets.iter().skip(1).enumerate() {
        assert_eq!(packet.data, unique_frame(i as u8));
    }
}

#[test]
fn dedup_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.pcap");
    let once = dir.path().join("once.pcap");
    let twice = dir.path().join("twice.pcap");

    let frames: Vec<Vec<u8>> = (0..5).map(unique_frame).chain((0..5).map(unique_frame)).collect();
    write_pcap(&input, &frames);

    let stage = DedupStage::new();
    let mut ctx = StageContext::new();
    stage.process_capture(&input, &once, &mut ctx).unwrap();
    let stats = stage.process_capture(&once, &twice, &mut ctx).unwrap();

    assert_eq!(stats.extra_u64("packets_dropped"), Some(0));
    assert_eq!(std::fs::read(&once).unwrap(), std::fs::read(&twice).unwrap());
}

#[test]
fn empty_input_produces_valid_empty_capture() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.pcap");
    let output = dir.path().join("out.pcap");
    write_pcap(&input, &[]);

    let stage = DedupStage::new();
    let mut ctx = StageContext::new();
    let stats = stage.process_capture(&input, &output, &mut ctx).unwrap();
    assert_eq!(stats.packets_processed, 0);
    assert!(read_pcap(&output).is_empty());
}

#[test]
fn zero_length_frames_collapse() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.pcap");
    let output = dir.path().join("out.pcap");
    write_pcap(&input, &[vec![], vec![], vec![1]]);

    let stage = DedupStage::new();
    let mut ctx = StageContext::new();
    let stats = stage.process_capture(&input, &output, &mut ctx).unwrap();
    assert_eq!(stats.extra_u64("packets_dropped"), Some(1));
    assert_eq!(read_pcap(&output).len(), 2);
}

#[test]
fn missing_input_aborts_stage() {
    let dir = tempfile::tempdir().unwrap();
    let stage = DedupStage::new();
    let mut ctx = StageContext::new();
    let err = stage
        .process_capture(
            &dir.path().join("absent.pcap"),
            &dir.path().join("out.pcap"),
            &mut ctx,
        )
        .unwrap_err();
    assert_eq!(err.category(), "input");
}
