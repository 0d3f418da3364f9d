// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Payload Masking Stage
//!
//! The application half of masking: streams the capture once and, for
//! every TCP segment of a flow the rule set knows, replaces every payload
//! byte outside the keep rules with `0x00`. Lengths are sacred: the
//! output payload is byte-for-byte the same size as the input payload,
//! checked on every packet, and a divergence is a hard error - a sanitised
//! trace with shifted sequence space would be worse than no trace.
//!
//! Per packet the hot path is: locate the innermost TCP, match the flow,
//! lift the raw sequence number with the same [`SeqState`] the marker
//! used, binary-search the overlapping rules, copy the protected ranges
//! back over an all-zero buffer, and skip the write-back entirely when
//! the result is bit-identical to the input (idempotence for free). The
//! TCP checksum is recomputed only for packets that changed.
//!
//! Packets are batched before writing; the batch flushes at the
//! configured size or earlier under memory pressure.
//!
//! ## Fallbacks
//!
//! - **Per packet** (`skip_packet` default, `full_mask`, `abort`): an
//!   unprocessable packet is written unchanged and counted, has its whole
//!   payload zeroed, or aborts the stage.
//! - **Stage level** (`copy_original` default, `abort`): when the marker
//!   is unavailable, crashed beyond its retries, or timed out, the input
//!   is copied to the output byte-for-byte and flagged - or the stage
//!   aborts, per configuration.

use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

use pktmask_domain::value_objects::keep_rule::KeepRuleSet;
use pktmask_domain::{
    FlowKey, MaskingSummary, PktMaskError, SeqState, StageContext, StageService, StageStats,
};

use crate::infrastructure::codec::checksum;
use crate::infrastructure::codec::layers::{self, LinkKind};
use crate::infrastructure::codec::reader::{CaptureFormat, CapturePacket, CaptureReader};
use crate::infrastructure::codec::writer::CaptureWriter;
use crate::infrastructure::config::FallbackMode;
use crate::infrastructure::marker::tls_marker::ProtocolMarker;
use crate::infrastructure::runtime::memory::MemoryMonitor;
use std::sync::Arc;

/// The payload masker.
pub struct MaskStage {
    marker: Arc<dyn ProtocolMarker>,
    fallback: FallbackMode,
    batch_size: usize,
    memory: MemoryMonitor,
}

impl MaskStage {
    pub fn new(
        marker: Arc<dyn ProtocolMarker>,
        fallback: FallbackMode,
        batch_size: usize,
        memory: MemoryMonitor,
    ) -> Self {
        Self {
            marker,
            fallback,
            batch_size: batch_size.max(1),
            memory,
        }
    }

    /// Stage-level degradation: copy the input byte-for-byte.
    fn copy_original(
        &self,
        input: &Path,
        output: &Path,
        reason: &PktMaskError,
        stats: &mut StageStats,
    ) -> Result<(), PktMaskError> {
        tracing::warn!(
            "masking degraded to copy_original for {}: {}",
            input.display(),
            reason
        );
        std::fs::copy(input, output)
            .map_err(|e| PktMaskError::io_error(format!("copy_original: {}", e)))?;
        stats.set_extra("fallback", "copy_original");
        stats.set_extra("fallback_reason", reason.category());
        Ok(())
    }
}

impl StageService for MaskStage {
    fn name(&self) -> &'static str {
        "mask_payloads"
    }

    fn process_capture(
        &self,
        input: &Path,
        output: &Path,
        ctx: &mut StageContext,
    ) -> Result<StageStats, PktMaskError> {
        let started = Instant::now();
        let mut stats = StageStats::new(self.name());

        let marker_output = match self.marker.analyze(input, ctx) {
            Ok(out) => out,
            Err(e @ PktMaskError::Cancelled(_)) => return Err(e),
            Err(e) if e.triggers_masking_fallback() && self.fallback != FallbackMode::Abort => {
                self.copy_original(input, output, &e, &mut stats)?;
                stats.duration = started.elapsed();
                return Ok(stats);
            }
            Err(e) => return Err(e),
        };

        let mut summary = MaskingSummary::default();
        for diag in marker_output.diagnostics {
            summary.diagnose(diag);
        }
        let rules = marker_output.rules;

        let mut reader = CaptureReader::open(input)?;
        let mut writer: Option<CaptureWriter> = None;
        let mut batch: Vec<CapturePacket> = Vec::with_capacity(self.batch_size);
        let mut batch_bytes: u64 = 0;
        let mut seq_states: HashMap<FlowKey, SeqState> = HashMap::new();

        while let Some(packet) = reader.next_packet() {
            ctx.check_cancelled()?;
            let mut packet = packet?;
            summary.packets_processed += 1;

            match mask_packet(
                &mut packet,
                u32::from(reader.link_type()),
                &rules,
                &mut seq_states,
                &mut summary,
            ) {
                Ok(modified) => {
                    if modified {
                        summary.packets_modified += 1;
                    }
                }
                Err(e) => match self.fallback {
                    FallbackMode::Abort => return Err(e),
                    FallbackMode::FullMask => {
                        summary.packets_fallback += 1;
                        summary.diagnose(format!("packet {}: {}", summary.packets_processed, e));
                        if full_mask_packet(&mut packet, u32::from(reader.link_type())) {
                            summary.packets_modified += 1;
                        }
                    }
                    // skip_packet; copy_original degrades to it per packet.
                    _ => {
                        summary.packets_fallback += 1;
                        summary.diagnose(format!("packet {}: {}", summary.packets_processed, e));
                    }
                },
            }

            batch_bytes += packet.data.len() as u64;
            batch.push(packet);
            if batch.len() >= self.batch_size || self.memory.should_flush(batch_bytes) {
                let writer = CaptureWriter::ensure(
                    &mut writer,
                    output,
                    reader.link_type(),
                    reader.ts_resolution(),
                )?;
                flush_batch(writer, &mut batch)?;
                batch_bytes = 0;
            }
        }

        let writer = match writer {
            Some(mut w) => {
                flush_batch(&mut w, &mut batch)?;
                w
            }
            None => {
                let mut w =
                    CaptureWriter::create(output, reader.link_type(), reader.ts_resolution())?;
                flush_batch(&mut w, &mut batch)?;
                w
            }
        };
        writer.finish()?;

        summary.apply_to(&mut stats);
        stats.set_extra("keep_rules", rules.rule_count());
        stats.set_extra("rule_flows", rules.flow_count());
        stats.set_extra("rules_discarded", rules.stats().candidates_discarded);
        if reader.format() == CaptureFormat::PcapNg {
            stats.set_extra("converted_to_pcap", true);
        }
        stats.duration = started.elapsed();
        tracing::debug!(
            "mask: {} packets, {} modified, {} bytes zeroed",
            stats.packets_processed,
            stats.packets_modified,
            summary.bytes_zeroed
        );
        Ok(stats)
    }
}

fn flush_batch(writer: &mut CaptureWriter, batch: &mut Vec<CapturePacket>) -> Result<(), PktMaskError> {
    for packet in batch.drain(..) {
        writer.write_packet(&packet)?;
    }
    Ok(())
}

/// Masks one packet in place. Returns whether it was modified.
///
/// Pass-through cases (no TCP, unknown flow, empty payload) are `Ok(false)`.
/// Errors are per-packet and subject to the fallback policy.
fn mask_packet(
    packet: &mut CapturePacket,
    link_type: u32,
    rules: &KeepRuleSet,
    seq_states: &mut HashMap<FlowKey, SeqState>,
    summary: &mut MaskingSummary,
) -> Result<bool, PktMaskError> {
    let Some(link) = LinkKind::from_link_type(link_type) else {
        return Ok(false);
    };
    let parsed = layers::parse_packet(&packet.data, link);
    let Some((ip, tcp)) = parsed.innermost_tcp() else {
        return Ok(false);
    };
    let flow = FlowKey::new(ip.src, tcp.src_port, ip.dst, tcp.dst_port);
    if !rules.covers_flow(&flow) {
        return Ok(false);
    }
    if tcp.payload_len == 0 {
        return Ok(false);
    }

    let logical = seq_states.entry(flow).or_default().lift(tcp.seq);
    let win_start = logical;
    let win_end = logical + tcp.payload_len as u64;
    let payload_offset = tcp.payload_offset;
    let payload_len = tcp.payload_len;
    if payload_offset + payload_len > packet.data.len() {
        return Err(PktMaskError::masking_error(
            "tcp payload extends past captured bytes",
        ));
    }

    // Start all-zero, copy back the protected ranges.
    let original = &packet.data[payload_offset..payload_offset + payload_len];
    let mut buffer = vec![0u8; payload_len];
    let mut preserved: u64 = 0;
    for rule in rules.overlapping(&flow, win_start, win_end) {
        let from = rule.start.max(win_start);
        let to = rule.end.min(win_end);
        let a = (from - win_start) as usize;
        let b = (to - win_start) as usize;
        buffer[a..b].copy_from_slice(&original[a..b]);
        preserved += (b - a) as u64;
    }

    if buffer.len() != payload_len {
        // Length invariance is the contract the whole design rests on.
        return Err(PktMaskError::masking_error(format!(
            "masked payload length {} != original {}",
            buffer.len(),
            payload_len
        )));
    }

    if buffer.as_slice() == original {
        return Ok(false);
    }

    let zeroed = buffer
        .iter()
        .zip(original.iter())
        .filter(|(b, o)| **b == 0 && **o != 0)
        .count() as u64;
    summary.bytes_zeroed += zeroed;
    summary.bytes_preserved += preserved;

    // Everything fallible is done; compute the pseudo-header sum from the
    // (possibly already pseudonymised) addresses before mutating.
    let (tcp_offset, checksum_offset, seg_len) = (tcp.offset, tcp.checksum_offset, ip.payload_len);
    let truncated = ip.truncated;
    let pseudo = match (ip.src, ip.dst) {
        (std::net::IpAddr::V4(s), std::net::IpAddr::V4(d)) => {
            checksum::pseudo_v4(s.octets(), d.octets(), layers::IPPROTO_TCP, seg_len as u32)
        }
        (std::net::IpAddr::V6(s), std::net::IpAddr::V6(d)) => {
            checksum::pseudo_v6(s.octets(), d.octets(), layers::IPPROTO_TCP, seg_len as u32)
        }
        _ => {
            return Err(PktMaskError::masking_error(
                "mixed address families in one header",
            ))
        }
    };

    packet.data[payload_offset..payload_offset + payload_len].copy_from_slice(&buffer);

    // Refresh the TCP checksum over the new payload. Header fields, IP
    // lengths and IP checksums are untouched: the payload length did not
    // change.
    if !truncated {
        let span = tcp_offset..tcp_offset + seg_len;
        if span.end <= packet.data.len() {
            let sum = checksum::transport(pseudo, &packet.data[span], checksum_offset - tcp_offset);
            checksum::put_u16(&mut packet.data, checksum_offset, sum);
        }
    }

    Ok(true)
}

/// Per-packet `full_mask` fallback: zero the entire innermost TCP payload.
fn full_mask_packet(packet: &mut CapturePacket, link_type: u32) -> bool {
    let Some(link) = LinkKind::from_link_type(link_type) else {
        return false;
    };
    let parsed = layers::parse_packet(&packet.data, link);
    let Some((_, tcp)) = parsed.innermost_tcp() else {
        return false;
    };
    if tcp.payload_len == 0 || tcp.payload_offset + tcp.payload_len > packet.data.len() {
        return false;
    }
    let (payload_offset, payload_len) = (tcp.payload_offset, tcp.payload_len);
    let was_nonzero = packet.data[payload_offset..payload_offset + payload_len]
        .iter()
        .any(|b| *b != 0);
    packet.data[payload_offset..payload_offset + payload_len].fill(0);
    was_nonzero
}
