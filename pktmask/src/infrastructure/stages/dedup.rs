// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Deduplication Stage
//!
//! Content-addressed removal of exact-duplicate packets within one file.
//! The fingerprint is a SHA-256 digest over the captured link-layer frame
//! bytes - capture metadata (timestamps, original length) is outside the
//! digest, so two observations of the same frame collapse even when the
//! capture clock differs.
//!
//! The seen-set stores fixed-size digests, never frames, so memory stays
//! `O(unique frames × 32 bytes)` for captures with tens of millions of
//! packets. Collision probability at 256 bits is negligible at any
//! plausible capture size.
//!
//! Zero-length frames all share one digest: the first is kept, the rest
//! drop, which is the intended duplicate semantics. Non-TCP and malformed
//! packets are fingerprinted the same way - deduplication parses nothing.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;
use std::time::Instant;

use pktmask_domain::{PktMaskError, StageContext, StageService, StageStats};

use crate::infrastructure::codec::reader::{CaptureFormat, CaptureReader};
use crate::infrastructure::codec::writer::CaptureWriter;

/// Order-preserving duplicate remover.
#[derive(Default)]
pub struct DedupStage;

impl DedupStage {
    pub fn new() -> Self {
        Self
    }
}

impl StageService for DedupStage {
    fn name(&self) -> &'static str {
        "remove_dupes"
    }

    fn process_capture(
        &self,
        input: &Path,
        output: &Path,
        ctx: &mut StageContext,
    ) -> Result<StageStats, PktMaskError> {
        let started = Instant::now();
        let mut stats = StageStats::new(self.name());
        let mut reader = CaptureReader::open(input)?;
        let mut writer: Option<CaptureWriter> = None;
        let mut seen: HashSet<[u8; 32]> = HashSet::new();
        let mut dropped: u64 = 0;

        while let Some(packet) = reader.next_packet() {
            ctx.check_cancelled()?;
            let packet = packet?;
            stats.packets_processed += 1;

            let digest: [u8; 32] = Sha256::digest(&packet.data).into();
            if seen.insert(digest) {
                let writer = CaptureWriter::ensure(
                    &mut writer,
                    output,
                    reader.link_type(),
                    reader.ts_resolution(),
                )?;
                writer.write_packet(&packet)?;
            } else {
                dropped += 1;
                tracing::trace!(
                    "dropping duplicate frame {} ({})",
                    stats.packets_processed,
                    hex::encode(&digest[..8])
                );
            }
        }

        // An input with no packets still produces a valid (empty) capture.
        let writer = match writer {
            Some(w) => w,
            None => CaptureWriter::create(output, reader.link_type(), reader.ts_resolution())?,
        };
        let written = writer.packets_written();
        writer.finish()?;

        stats.set_extra("packets_dropped", dropped);
        stats.set_extra("packets_written", written);
        stats.set_extra("unique_frames", seen.len());
        if reader.format() == CaptureFormat::PcapNg {
            stats.set_extra("converted_to_pcap", true);
        }
        if reader.trailing_truncation() {
            stats.set_extra("trailing_truncation", true);
        }
        stats.duration = started.elapsed();
        tracing::debug!(
            "dedup: {} packets in, {} duplicates dropped",
            stats.packets_processed,
            dropped
        );
        Ok(stats)
    }
}
