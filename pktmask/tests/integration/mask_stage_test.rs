// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Masking stage behaviour with a controlled rule set.
//!
//! The marker is stubbed so these tests pin down the *application* half of
//! masking: rule lookup, zero-fill, length invariance, checksum refresh,
//! fallbacks. Rule *production* from TLS framing is covered by the marker's
//! own unit tests.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::Arc;

use pktmask_domain::{
    FlowKey, KeepRule, KeepRuleSet, PktMaskError, RuleKind, StageContext, StageService,
};

use pktmask::infrastructure::config::FallbackMode;
use pktmask::infrastructure::marker::tls_marker::{MarkerOutput, ProtocolMarker};
use pktmask::infrastructure::runtime::memory::MemoryMonitor;
use pktmask::infrastructure::stages::MaskStage;

use crate::common::{assert_checksums_valid, payload_of, read_pcap, tcp_frame, tls_record, write_pcap};

const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const CLIENT_PORT: u16 = 51000;

fn client_flow() -> FlowKey {
    FlowKey::new(IpAddr::V4(CLIENT), CLIENT_PORT, IpAddr::V4(SERVER), 443)
}

/// A marker that returns a canned rule set.
struct FixedMarker {
    rules: KeepRuleSet,
}

impl FixedMarker {
    fn stage(rules: KeepRuleSet, fallback: FallbackMode) -> MaskStage {
        MaskStage::new(
            Arc::new(FixedMarker { rules }),
            fallback,
            1000,
            MemoryMonitor::new(2048),
        )
    }
}

impl ProtocolMarker for FixedMarker {
    fn protocol(&self) -> &'static str {
        "tls"
    }

    fn analyze(&self, _capture: &Path, _ctx: &StageContext) -> Result<MarkerOutput, PktMaskError> {
        Ok(MarkerOutput {
            rules: self.rules.clone(),
            diagnostics: Vec::new(),
        })
    }
}

/// A marker standing in for a missing external tool.
struct UnavailableMarker;

impl ProtocolMarker for UnavailableMarker {
    fn protocol(&self) -> &'static str {
        "tls"
    }

    fn analyze(&self, _capture: &Path, _ctx: &StageContext) -> Result<MarkerOutput, PktMaskError> {
        Err(PktMaskError::MarkerUnavailable("tshark not found".into()))
    }
}

fn run_stage(stage: &MaskStage, input: &Path, output: &Path) {
    let mut ctx = StageContext::new();
    stage.process_capture(input, output, &mut ctx).unwrap();
}

#[test]
fn application_data_record_keeps_header_zeroes_body() {
    let dir = tempfile::tempdir().unwrap();
    let (input, output) = (dir.path().join("in.pcap"), dir.path().join("out.pcap"));

    // One 273-byte ApplicationData record (278 bytes on the wire).
    let seq = 5000u32;
    let record = tls_record(23, &[0xAB; 273]);
    assert_eq!(record.len(), 278);
    let frame = tcp_frame(CLIENT, SERVER, CLIENT_PORT, 443, seq, &record);
    write_pcap(&input, &[frame.clone()]);

    let mut rules = KeepRuleSet::new();
    rules.push(
        client_flow(),
        KeepRule::header_only(u64::from(seq), u64::from(seq) + 5, RuleKind::ApplicationData).unwrap(),
    );
    rules.normalize();
    let stage = FixedMarker::stage(rules, FallbackMode::SkipPacket);

    let mut ctx = StageContext::new();
    let stats = stage.process_capture(&input, &output, &mut ctx).unwrap();
    assert_eq!(stats.packets_processed, 1);
    assert_eq!(stats.packets_modified, 1);
    assert_eq!(stats.extra_u64("bytes_zeroed"), Some(273));

    let masked = &read_pcap(&output)[0].data;
    assert_eq!(masked.len(), frame.len(), "on-wire length invariant");
    let payload = payload_of(masked);
    assert_eq!(&payload[..5], &record[..5], "record header preserved");
    assert!(payload[5..].iter().all(|b| *b == 0), "body fully zeroed");
    // Sequence number untouched, checksum refreshed.
    assert_eq!(&masked[38..42], &frame[38..42]);
    assert_checksums_valid(masked);
}

#[test]
fn handshake_fragments_pass_unmodified() {
    let dir = tempfile::tempdir().unwrap();
    let (input, output) = (dir.path().join("in.pcap"), dir.path().join("out.pcap"));

    // A 512-byte handshake record split 405 / 100 / 12.
    let whole = tls_record(22, &[0x01; 512]);
    let base = 7000u64;
    let frames = vec![
        tcp_frame(CLIENT, SERVER, CLIENT_PORT, 443, base as u32, &whole[..405]),
        tcp_frame(CLIENT, SERVER, CLIENT_PORT, 443, (base + 405) as u32, &whole[405..505]),
        tcp_frame(CLIENT, SERVER, CLIENT_PORT, 443, (base + 505) as u32, &whole[505..]),
    ];
    write_pcap(&input, &frames);

    let mut rules = KeepRuleSet::new();
    rules.push(
        client_flow(),
        KeepRule::full(base, base + 517, RuleKind::Handshake).unwrap(),
    );
    rules.normalize();
    let stage = FixedMarker::stage(rules, FallbackMode::SkipPacket);

    let mut ctx = StageContext::new();
    let stats = stage.process_capture(&input, &output, &mut ctx).unwrap();
    assert_eq!(stats.packets_modified, 0, "fully kept segments are not modifications");

    let packets = read_pcap(&output);
    for (packet, original) in packets.iter().zip(&frames) {
        assert_eq!(packet.data, *original);
    }
}

#[test]
fn three_records_in_one_segment_keep_three_headers() {
    let dir = tempfile::tempdir().unwrap();
    let (input, output) = (dir.path().join("in.pcap"), dir.path().join("out.pcap"));

    let mut payload = Vec::new();
    for _ in 0..3 {
        payload.extend_from_slice(&tls_record(23, &[0x77; 100]));
    }
    assert_eq!(payload.len(), 315);
    let seq = 100u32;
    write_pcap(&input, &[tcp_frame(CLIENT, SERVER, CLIENT_PORT, 443, seq, &payload)]);

    let mut rules = KeepRuleSet::new();
    for offset in [0u64, 105, 210] {
        let start = u64::from(seq) + offset;
        rules.push(
            client_flow(),
            KeepRule::header_only(start, start + 5, RuleKind::ApplicationData).unwrap(),
        );
    }
    rules.normalize();
    let stage = FixedMarker::stage(rules, FallbackMode::SkipPacket);
    run_stage(&stage, &input, &output);

    let masked = read_pcap(&output);
    let out = payload_of(&masked[0].data);
    for offset in [0usize, 105, 210] {
        assert_eq!(&out[offset..offset + 5], &payload[offset..offset + 5]);
        assert!(out[offset + 5..offset + 105].iter().all(|b| *b == 0));
    }
}

#[test]
fn every_byte_is_zero_or_original() {
    let dir = tempfile::tempdir().unwrap();
    let (input, output) = (dir.path().join("in.pcap"), dir.path().join("out.pcap"));

    let payload: Vec<u8> = (0..=255u8).cycle().take(700).collect();
    let seq = 1u32;
    write_pcap(&input, &[tcp_frame(CLIENT, SERVER, CLIENT_PORT, 443, seq, &payload)]);

    let mut rules = KeepRuleSet::new();
    rules.push(client_flow(), KeepRule::full(40, 90, RuleKind::Other).unwrap());
    rules.push(
        client_flow(),
        KeepRule::header_only(300, 305, RuleKind::ApplicationData).unwrap(),
    );
    rules.normalize();
    let stage = FixedMarker::stage(rules, FallbackMode::SkipPacket);
    run_stage(&stage, &input, &output);

    let out = read_pcap(&output)[0].data.clone();
    let masked_payload = payload_of(&out);
    assert_eq!(masked_payload.len(), payload.len());
    for (i, (m, o)) in masked_payload.iter().zip(&payload).enumerate() {
        assert!(*m == 0 || m == o, "byte {} is neither zero nor original", i);
    }
    // The kept windows really survived (window = logical range - seq).
    assert_eq!(&masked_payload[39..89], &payload[39..89]);
    assert_eq!(&masked_payload[299..304], &payload[299..304]);
}

#[test]
fn unknown_flow_passes_through() {
    let dir = tempfile::tempdir().unwrap();
    let (input, output) = (dir.path().join("in.pcap"), dir.path().join("out.pcap"));

    let frame = tcp_frame(
        Ipv4Addr::new(172, 16, 0, 1),
        Ipv4Addr::new(172, 16, 0, 2),
        1111,
        2222,
        50,
        b"not tls, not marked",
    );
    write_pcap(&input, &[frame.clone()]);

    // Rules exist, but for a different conversation.
    let mut rules = KeepRuleSet::new();
    rules.push(client_flow(), KeepRule::full(0, 10, RuleKind::Handshake).unwrap());
    rules.normalize();
    let stage = FixedMarker::stage(rules, FallbackMode::SkipPacket);

    let mut ctx = StageContext::new();
    let stats = stage.process_capture(&input, &output, &mut ctx).unwrap();
    assert_eq!(stats.packets_modified, 0);
    assert_eq!(read_pcap(&output)[0].data, frame);
}

#[test]
fn covered_flow_without_rules_is_fully_masked() {
    let dir = tempfile::tempdir().unwrap();
    let (input, output) = (dir.path().join("in.pcap"), dir.path().join("out.pcap"));

    // Server-to-client segment; only the client direction has rules, but
    // the conversation is known, so this direction masks completely.
    let frame = tcp_frame(SERVER, CLIENT, 443, CLIENT_PORT, 900, &[0x5A; 64]);
    write_pcap(&input, &[frame]);

    let mut rules = KeepRuleSet::new();
    rules.push(client_flow(), KeepRule::full(0, 10, RuleKind::Handshake).unwrap());
    rules.normalize();
    let stage = FixedMarker::stage(rules, FallbackMode::SkipPacket);
    run_stage(&stage, &input, &output);

    let out = read_pcap(&output)[0].data.clone();
    assert!(payload_of(&out).iter().all(|b| *b == 0));
    assert_checksums_valid(&out);
}

#[test]
fn zero_length_payloads_pass_through() {
    let dir = tempfile::tempdir().unwrap();
    let (input, output) = (dir.path().join("in.pcap"), dir.path().join("out.pcap"));

    let frame = tcp_frame(CLIENT, SERVER, CLIENT_PORT, 443, 77, b"");
    write_pcap(&input, &[frame.clone()]);

    let mut rules = KeepRuleSet::new();
    rules.mark_flow(client_flow());
    rules.normalize();
    let stage = FixedMarker::stage(rules, FallbackMode::SkipPacket);

    let mut ctx = StageContext::new();
    let stats = stage.process_capture(&input, &output, &mut ctx).unwrap();
    assert_eq!(stats.packets_modified, 0);
    assert_eq!(read_pcap(&output)[0].data, frame);
}

#[test]
fn masking_twice_is_identical() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.pcap");
    let once = dir.path().join("once.pcap");
    let twice = dir.path().join("twice.pcap");

    let record = tls_record(23, &[0xCD; 150]);
    let seq = 3000u32;
    write_pcap(&input, &[tcp_frame(CLIENT, SERVER, CLIENT_PORT, 443, seq, &record)]);

    let mut rules = KeepRuleSet::new();
    rules.push(
        client_flow(),
        KeepRule::header_only(u64::from(seq), u64::from(seq) + 5, RuleKind::ApplicationData).unwrap(),
    );
    rules.normalize();

    let stage = FixedMarker::stage(rules.clone(), FallbackMode::SkipPacket);
    run_stage(&stage, &input, &once);
    let stage = FixedMarker::stage(rules, FallbackMode::SkipPacket);
    let mut ctx = StageContext::new();
    let stats = stage.process_capture(&once, &twice, &mut ctx).unwrap();

    assert_eq!(stats.packets_modified, 0, "second pass changes nothing");
    assert_eq!(
        read_pcap(&once)[0].data,
        read_pcap(&twice)[0].data
    );
}

#[test]
fn sequence_wrap_keeps_rule_alignment() {
    let dir = tempfile::tempdir().unwrap();
    let (input, output) = (dir.path().join("in.pcap"), dir.path().join("out.pcap"));

    // A record spanning the 2^32 boundary: first segment just below the
    // wrap, second at seq 0.
    let seq1 = u32::MAX - 255; // 256 payload bytes reach exactly the wrap
    let frames = vec![
        tcp_frame(CLIENT, SERVER, CLIENT_PORT, 443, seq1, &[0x11; 256]),
        tcp_frame(CLIENT, SERVER, CLIENT_PORT, 443, 0, &[0x22; 100]),
    ];
    write_pcap(&input, &frames);

    let start = u64::from(seq1);
    let mut rules = KeepRuleSet::new();
    rules.push(
        client_flow(),
        KeepRule::full(start, (1u64 << 32) + 100, RuleKind::Handshake).unwrap(),
    );
    rules.normalize();
    let stage = FixedMarker::stage(rules, FallbackMode::SkipPacket);

    let mut ctx = StageContext::new();
    let stats = stage.process_capture(&input, &output, &mut ctx).unwrap();
    assert_eq!(
        stats.packets_modified, 0,
        "both sides of the wrap fall inside the keep rule"
    );
    let packets = read_pcap(&output);
    assert_eq!(packets[0].data, frames[0]);
    assert_eq!(packets[1].data, frames[1]);
}

#[test]
fn retransmission_gets_the_same_mask() {
    let dir = tempfile::tempdir().unwrap();
    let (input, output) = (dir.path().join("in.pcap"), dir.path().join("out.pcap"));

    let record = tls_record(23, &[0xEE; 60]);
    let seq = 4000u32;
    let frame = tcp_frame(CLIENT, SERVER, CLIENT_PORT, 443, seq, &record);
    // Same segment captured twice (retransmission).
    write_pcap(&input, &[frame.clone(), frame]);

    let mut rules = KeepRuleSet::new();
    rules.push(
        client_flow(),
        KeepRule::header_only(u64::from(seq), u64::from(seq) + 5, RuleKind::ApplicationData).unwrap(),
    );
    rules.normalize();
    let stage = FixedMarker::stage(rules, FallbackMode::SkipPacket);
    run_stage(&stage, &input, &output);

    let packets = read_pcap(&output);
    assert_eq!(packets[0].data, packets[1].data, "identical mask for identical seq");
}

#[test]
fn marker_unavailable_degrades_to_copy_original() {
    let dir = tempfile::tempdir().unwrap();
    let (input, output) = (dir.path().join("in.pcap"), dir.path().join("out.pcap"));

    let frame = tcp_frame(CLIENT, SERVER, CLIENT_PORT, 443, 1, &tls_record(23, &[9; 50]));
    write_pcap(&input, &[frame]);

    let stage = MaskStage::new(
        Arc::new(UnavailableMarker),
        FallbackMode::CopyOriginal,
        1000,
        MemoryMonitor::new(2048),
    );
    let mut ctx = StageContext::new();
    let stats = stage.process_capture(&input, &output, &mut ctx).unwrap();

    assert_eq!(stats.extra.get("fallback").map(String::as_str), Some("copy_original"));
    assert_eq!(
        std::fs::read(&input).unwrap(),
        std::fs::read(&output).unwrap(),
        "copy_original preserves the input byte-for-byte"
    );
}

#[test]
fn marker_unavailable_with_abort_fails_the_stage() {
    let dir = tempfile::tempdir().unwrap();
    let (input, output) = (dir.path().join("in.pcap"), dir.path().join("out.pcap"));
    write_pcap(&input, &[tcp_frame(CLIENT, SERVER, CLIENT_PORT, 443, 1, b"x")]);

    let stage = MaskStage::new(
        Arc::new(UnavailableMarker),
        FallbackMode::Abort,
        1000,
        MemoryMonitor::new(2048),
    );
    let mut ctx = StageContext::new();
    let err = stage.process_capture(&input, &output, &mut ctx).unwrap_err();
    assert_eq!(err.category(), "marker");
    assert!(!output.exists());
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        /// For arbitrary payloads and rule sets: lengths never change and
        /// every output byte is either zero or the original byte; bytes
        /// under a keep rule are always the original.
        #[test]
        fn prop_mask_invariants(
            payload in proptest::collection::vec(any::<u8>(), 1..600),
            ranges in proptest::collection::vec((0u64..600, 1u64..64, any::<bool>()), 0..8),
            seq in any::<u32>(),
        ) {
            let dir = tempfile::tempdir().unwrap();
            let (input, output) = (dir.path().join("in.pcap"), dir.path().join("out.pcap"));
            let frame = tcp_frame(CLIENT, SERVER, CLIENT_PORT, 443, seq, &payload);
            write_pcap(&input, &[frame.clone()]);

            let base = u64::from(seq);
            let mut rules = KeepRuleSet::new();
            rules.mark_flow(client_flow());
            for (offset, len, header_only) in &ranges {
                let rule = if *header_only {
                    KeepRule::header_only(base + offset, base + offset + len, RuleKind::ApplicationData)
                } else {
                    KeepRule::full(base + offset, base + offset + len, RuleKind::Handshake)
                };
                rules.push(client_flow(), rule.unwrap());
            }
            rules.normalize();
            let kept = rules.rules_for(&client_flow()).to_vec();

            let stage = FixedMarker::stage(rules, FallbackMode::Abort);
            let mut ctx = StageContext::new();
            stage.process_capture(&input, &output, &mut ctx).unwrap();

            let out = read_pcap(&output).remove(0).data;
            prop_assert_eq!(out.len(), frame.len());
            let masked = payload_of(&out);
            prop_assert_eq!(masked.len(), payload.len());
            for (i, (m, o)) in masked.iter().zip(&payload).enumerate() {
                prop_assert!(*m == 0 || m == o, "byte {} neither zero nor original", i);
                let logical = base + i as u64;
                if kept.iter().any(|r| r.overlaps(logical, logical + 1)) {
                    prop_assert_eq!(m, o, "kept byte {} was altered", i);
                }
            }
        }
    }
}

#[test]
fn small_batch_size_flushes_correctly() {
    let dir = tempfile::tempdir().unwrap();
    let (input, output) = (dir.path().join("in.pcap"), dir.path().join("out.pcap"));

    let frames: Vec<Vec<u8>> = (0..7u32)
        .map(|i| tcp_frame(CLIENT, SERVER, CLIENT_PORT, 443, 1000 + i * 10, &[i as u8; 10]))
        .collect();
    write_pcap(&input, &frames);

    let mut rules = KeepRuleSet::new();
    rules.mark_flow(client_flow());
    rules.normalize();
    let stage = MaskStage::new(
        Arc::new(FixedMarker { rules }),
        FallbackMode::SkipPacket,
        2, // force several flushes
        MemoryMonitor::new(2048),
    );
    let mut ctx = StageContext::new();
    let stats = stage.process_capture(&input, &output, &mut ctx).unwrap();
    assert_eq!(stats.packets_processed, 7);
    assert_eq!(read_pcap(&output).len(), 7);
}
