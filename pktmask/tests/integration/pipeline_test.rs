// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Whole-pipeline behaviour through the directory controller.

use std::net::Ipv4Addr;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use pktmask_domain::events::progress_event::null_sink;
use pktmask_domain::{ProgressEvent, ProgressSink};

use pktmask::application::services::DirectoryProcessor;
use pktmask::infrastructure::config::PktMaskConfig;

use crate::common::{read_pcap, tcp_frame, write_pcap};

fn live_flag() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

/// Dedup on, everything else off: ten duplicates of one frame plus twenty
/// unique packets go in, twenty-one come out, untouched.
#[tokio::test]
async fn dedup_only_run_drops_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let input_dir = dir.path().join("in");
    let output_dir = dir.path().join("out");
    std::fs::create_dir(&input_dir).unwrap();

    // 20 unique packets, the first of which appears ten more times: 30 in,
    // 20 out, 10 dropped.
    let unique: Vec<Vec<u8>> = (0..20u8)
        .map(|i| {
            tcp_frame(
                Ipv4Addr::new(10, 0, 1, i),
                Ipv4Addr::new(10, 0, 2, i),
                41_000 + u16::from(i),
                80,
                100 + u32::from(i),
                &[i; 8],
            )
        })
        .collect();
    let mut frames = unique.clone();
    for _ in 0..10 {
        frames.push(unique[0].clone());
    }
    write_pcap(&input_dir.join("trace.pcap"), &frames);

    let mut config = PktMaskConfig::default();
    config.apply_toggles(false, true, true); // anonymise off, mask off

    let processor = DirectoryProcessor::new(config, null_sink(), live_flag(), 1).unwrap();
    let summary = processor.run(&input_dir, &output_dir).await.unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 0);
    let result = &summary.results[0];
    assert!(result.success);

    let dedup = result.stage("remove_dupes").unwrap();
    assert_eq!(dedup.packets_processed, 30);
    assert_eq!(dedup.packets_modified, 0);
    assert_eq!(dedup.extra_u64("packets_dropped"), Some(10));

    let packets = read_pcap(&output_dir.join("trace.pcap"));
    assert_eq!(packets.len(), 20);
    // Kept packets are byte-identical to the corresponding inputs.
    for (packet, frame) in packets.iter().zip(&unique) {
        assert_eq!(&packet.data, frame);
    }
}

/// All stages disabled: the output equals the input, packet for packet.
#[tokio::test]
async fn all_stages_disabled_is_identity() {
    let dir = tempfile::tempdir().unwrap();
    let input_dir = dir.path().join("in");
    let output_dir = dir.path().join("out");
    std::fs::create_dir(&input_dir).unwrap();

    let frames = vec![
        tcp_frame(
            Ipv4Addr::new(1, 2, 3, 4),
            Ipv4Addr::new(5, 6, 7, 8),
            9,
            10,
            11,
            b"hello world",
        ),
        vec![0xde, 0xad, 0xbe, 0xef],
    ];
    write_pcap(&input_dir.join("t.pcap"), &frames);

    let mut config = PktMaskConfig::default();
    config.apply_toggles(true, true, true);

    let processor = DirectoryProcessor::new(config, null_sink(), live_flag(), 1).unwrap();
    let summary = processor.run(&input_dir, &output_dir).await.unwrap();
    assert_eq!(summary.succeeded, 1);

    let outputs = read_pcap(&output_dir.join("t.pcap"));
    let inputs = read_pcap(&input_dir.join("t.pcap"));
    assert_eq!(outputs.len(), inputs.len());
    for (a, b) in inputs.iter().zip(&outputs) {
        assert_eq!(a.data, b.data);
        assert_eq!(a.timestamp, b.timestamp);
    }
}

/// The same address appearing in two files maps to the same pseudonym in
/// both outputs - the cross-file consistency the pre-scan exists for.
#[tokio::test]
async fn pseudonyms_are_consistent_across_files() {
    let dir = tempfile::tempdir().unwrap();
    let input_dir = dir.path().join("in");
    let output_dir = dir.path().join("out");
    std::fs::create_dir(&input_dir).unwrap();

    let shared = Ipv4Addr::new(10, 0, 0, 5);
    write_pcap(
        &input_dir.join("a.pcap"),
        &[tcp_frame(shared, Ipv4Addr::new(10, 0, 0, 9), 1, 2, 3, b"a")],
    );
    write_pcap(
        &input_dir.join("b.pcap"),
        &[tcp_frame(Ipv4Addr::new(10, 0, 7, 7), shared, 4, 5, 6, b"b")],
    );

    let mut config = PktMaskConfig::default();
    config.apply_toggles(true, false, true); // anonymise only

    let processor = DirectoryProcessor::new(config, null_sink(), live_flag(), 1).unwrap();
    let summary = processor.run(&input_dir, &output_dir).await.unwrap();
    assert_eq!(summary.succeeded, 2);

    let a = read_pcap(&output_dir.join("a.pcap"));
    let b = read_pcap(&output_dir.join("b.pcap"));
    // `shared` was the source in file a, the destination in file b.
    let pseudonym_in_a = &a[0].data[14 + 12..14 + 16];
    let pseudonym_in_b = &b[0].data[14 + 16..14 + 20];
    assert_eq!(pseudonym_in_a, pseudonym_in_b);
    assert_ne!(pseudonym_in_a, shared.octets().as_slice());
}

/// A corrupt file fails alone; the rest of the run continues.
#[tokio::test]
async fn bad_file_does_not_stop_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let input_dir = dir.path().join("in");
    let output_dir = dir.path().join("out");
    std::fs::create_dir(&input_dir).unwrap();

    std::fs::write(input_dir.join("bad.pcap"), b"this is not a capture").unwrap();
    write_pcap(
        &input_dir.join("good.pcap"),
        &[tcp_frame(Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(2, 2, 2, 2), 1, 2, 3, b"ok")],
    );

    let mut config = PktMaskConfig::default();
    config.apply_toggles(false, true, true);

    let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_errors = errors.clone();
    let sink: ProgressSink = Arc::new(move |ev| {
        if let ProgressEvent::Error { kind, .. } = ev {
            sink_errors.lock().unwrap().push(kind.clone());
        }
    });

    let processor = DirectoryProcessor::new(config, sink, live_flag(), 1).unwrap();
    let summary = processor.run(&input_dir, &output_dir).await.unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);
    assert!(summary.any_failed());
    // The failed file produced no output; the good one did.
    assert!(!output_dir.join("bad.pcap").exists());
    assert!(output_dir.join("good.pcap").exists());
    assert!(!errors.lock().unwrap().is_empty());
    // Input-order reporting regardless of completion order.
    assert!(summary.results[0].input_path.ends_with("bad.pcap"));
    assert!(summary.results[1].input_path.ends_with("good.pcap"));
}

/// Parallel workers produce the same outputs as a sequential run.
#[tokio::test]
async fn parallel_workers_match_sequential_output() {
    let dir = tempfile::tempdir().unwrap();
    let input_dir = dir.path().join("in");
    std::fs::create_dir(&input_dir).unwrap();

    for f in 0..4u8 {
        let frames: Vec<Vec<u8>> = (0..6u8)
            .map(|i| {
                tcp_frame(
                    Ipv4Addr::new(10, f, 0, i),
                    Ipv4Addr::new(10, f, 1, i),
                    1000,
                    2000,
                    u32::from(i),
                    &[f ^ i; 12],
                )
            })
            .collect();
        write_pcap(&input_dir.join(format!("f{}.pcap", f)), &frames);
    }

    let mut config = PktMaskConfig::default();
    config.apply_toggles(false, true, true);

    let out_seq = dir.path().join("seq");
    let out_par = dir.path().join("par");
    let sequential =
        DirectoryProcessor::new(config.clone(), null_sink(), live_flag(), 1).unwrap();
    sequential.run(&input_dir, &out_seq).await.unwrap();
    let parallel = DirectoryProcessor::new(config, null_sink(), live_flag(), 4).unwrap();
    parallel.run(&input_dir, &out_par).await.unwrap();

    for f in 0..4u8 {
        let name = format!("f{}.pcap", f);
        assert_eq!(
            std::fs::read(out_seq.join(&name)).unwrap(),
            std::fs::read(out_par.join(&name)).unwrap()
        );
    }
}

/// A cancelled run starts no further files.
#[tokio::test]
async fn cancellation_stops_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let input_dir = dir.path().join("in");
    let output_dir = dir.path().join("out");
    std::fs::create_dir(&input_dir).unwrap();
    write_pcap(
        &input_dir.join("a.pcap"),
        &[tcp_frame(Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(2, 2, 2, 2), 1, 2, 3, b"x")],
    );

    let mut config = PktMaskConfig::default();
    config.apply_toggles(false, true, true);

    let flag = Arc::new(AtomicBool::new(true)); // cancelled before start
    let processor = DirectoryProcessor::new(config, null_sink(), flag, 1).unwrap();
    let summary = processor.run(&input_dir, &output_dir).await.unwrap();
    assert!(summary.cancelled);
    assert!(summary.results.is_empty());
    assert!(!output_dir.join("a.pcap").exists());
}
