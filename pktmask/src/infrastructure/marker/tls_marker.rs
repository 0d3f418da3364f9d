// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # TLS Marker
//!
//! The analysis half of the masking stage: consumes the capture once and
//! produces the [`KeepRuleSet`] the masker applies. The external parser
//! says *which frames carry TLS records of which types*; this module walks
//! the actual segment bytes and decides *which byte ranges survive*:
//!
//! 1. Frames the scan claimed mark their flow as TLS (both directions).
//! 2. Per flow direction a [`SeqState`] lifts raw sequence numbers - the
//!    identical lift the masker performs, so both sides agree on every
//!    logical coordinate.
//! 3. Segment payloads are walked record by record: an in-band 5-byte
//!    header that parses plausibly and survives the validation gates opens
//!    a record; a record longer than its segment leaves a pending
//!    remainder that the following segments of the same direction consume
//!    (the only cross-segment reasoning in the system, and it is logical -
//!    no payload is ever reassembled); a segment with no plausible header
//!    at offset zero is a fragment of the pending record.
//! 4. The policy table turns each record into rules: whole-record ranges,
//!    or a header-only range for ApplicationData (fragments of an
//!    ApplicationData record contribute nothing).
//!
//! Every gate failure discards the candidate, counts it, logs a
//! diagnostic, and stops trusting the rest of that segment - unparsed
//! bytes default to masked, which is the safe direction.
//!
//! New protocols plug in through [`ProtocolMarker`]; the compiled-in
//! registry maps protocol names to implementations and resolves `auto` to
//! the single registered analyser.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pktmask_domain::services::tls_policy::{TlsPolicy, TlsRecordHeader, TLS_RECORD_HEADER_LEN};
use pktmask_domain::value_objects::flow_key::TwoWayFlowKey;
use pktmask_domain::{FlowKey, KeepRule, KeepRuleSet, PktMaskError, RuleKind, SeqState, StageContext, TlsContentType};

use crate::infrastructure::codec::layers::{self, LinkKind};
use crate::infrastructure::codec::reader::CaptureReader;
use crate::infrastructure::marker::tshark::{RecordClaim, TsharkRunner, TsharkScan};

/// What a marker hands the masker.
#[derive(Debug, Default)]
pub struct MarkerOutput {
    pub rules: KeepRuleSet,
    /// Human-readable gate failures, capped by the masker's summary.
    pub diagnostics: Vec<String>,
}

/// A protocol analyser producing keep rules.
///
/// Compiled-in implementations register with [`MarkerRegistry`]; no
/// dynamic loading.
pub trait ProtocolMarker: Send + Sync {
    fn protocol(&self) -> &'static str;

    fn analyze(&self, capture: &Path, ctx: &StageContext) -> Result<MarkerOutput, PktMaskError>;
}

/// Registry of compiled-in markers, keyed by protocol name.
pub struct MarkerRegistry {
    markers: HashMap<&'static str, Arc<dyn ProtocolMarker>>,
}

impl MarkerRegistry {
    /// The standard registry: TLS only.
    pub fn standard(policy: TlsPolicy, timeout: Duration, max_retries: u32) -> Self {
        let mut markers: HashMap<&'static str, Arc<dyn ProtocolMarker>> = HashMap::new();
        let tls = Arc::new(TlsMarker::new(policy, timeout, max_retries));
        markers.insert(tls.protocol(), tls);
        Self { markers }
    }

    /// Resolves a configured protocol name. `auto` resolves to the single
    /// registered analyser; with several registered it would be ambiguous
    /// and is rejected.
    pub fn resolve(&self, protocol: &str) -> Result<Arc<dyn ProtocolMarker>, PktMaskError> {
        if protocol == "auto" {
            if self.markers.len() == 1 {
                return Ok(self.markers.values().next().expect("len checked").clone());
            }
            return Err(PktMaskError::invalid_config(format!(
                "protocol 'auto' is ambiguous with {} analysers registered",
                self.markers.len()
            )));
        }
        self.markers.get(protocol).cloned().ok_or_else(|| {
            PktMaskError::invalid_config(format!(
                "unknown masking protocol '{}' (registered: {:?})",
                protocol,
                self.markers.keys().collect::<Vec<_>>()
            ))
        })
    }

    pub fn protocols(&self) -> Vec<&'static str> {
        self.markers.keys().copied().collect()
    }
}

/// The TLS analyser.
pub struct TlsMarker {
    policy: TlsPolicy,
    runner: TsharkRunner,
    max_retries: u32,
}

impl TlsMarker {
    pub fn new(policy: TlsPolicy, timeout: Duration, max_retries: u32) -> Self {
        Self {
            policy,
            runner: TsharkRunner::new(timeout),
            max_retries,
        }
    }

    /// Runs the external scan, retrying crashes and unparseable output.
    /// A missing tool or a timeout is not retried: the former is a
    /// deployment problem, the latter will not improve on a second pass.
    fn scan_with_retries(&self, capture: &Path, ctx: &StageContext) -> Result<TsharkScan, PktMaskError> {
        let mut attempt = 0;
        loop {
            match self.runner.scan(capture, ctx) {
                Ok(scan) => return Ok(scan),
                Err(e @ PktMaskError::MarkerError(_)) if attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        "marker attempt {}/{} failed, retrying: {}",
                        attempt,
                        self.max_retries,
                        e
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl ProtocolMarker for TlsMarker {
    fn protocol(&self) -> &'static str {
        "tls"
    }

    fn analyze(&self, capture: &Path, ctx: &StageContext) -> Result<MarkerOutput, PktMaskError> {
        let scan = self.scan_with_retries(capture, ctx)?;
        let mut output = MarkerOutput::default();
        if scan.is_empty() {
            tracing::debug!("{}: no TLS claimed by the external parser", capture.display());
            return Ok(output);
        }

        let mut walks: HashMap<FlowKey, DirectionWalk> = HashMap::new();
        let mut tls_flows: HashSet<TwoWayFlowKey> = HashSet::new();
        let mut reader = CaptureReader::open(capture)?;
        let mut frame_no: u64 = 0;

        while let Some(packet) = reader.next_packet() {
            ctx.check_cancelled()?;
            let packet = packet?;
            frame_no += 1;

            let Some(link) = LinkKind::from_link_type(u32::from(reader.link_type())) else {
                continue;
            };
            let parsed = layers::parse_packet(&packet.data, link);
            let Some((ip, tcp)) = parsed.innermost_tcp() else {
                continue;
            };
            let flow = FlowKey::new(ip.src, tcp.src_port, ip.dst, tcp.dst_port);

            if scan.claims.contains_key(&frame_no) {
                tls_flows.insert(flow.into());
                output.rules.mark_flow(flow);
            }
            if tcp.payload_len == 0 {
                continue;
            }

            // The lift runs for every payload-carrying segment of every
            // flow, exactly as the masker will run it.
            let walk = walks.entry(flow).or_default();
            let logical = walk.seq.lift(tcp.seq);

            if !tls_flows.contains(&TwoWayFlowKey::from(flow)) {
                continue;
            }
            let payload = &packet.data[tcp.payload_offset..tcp.payload_offset + tcp.payload_len];
            let mut claims = scan.claims.get(&frame_no).cloned().unwrap_or_default();
            walk_segment(
                &self.policy,
                walk,
                flow,
                payload,
                logical,
                &mut claims,
                &mut output.rules,
                &mut output.diagnostics,
            );
        }

        output.rules.normalize();
        tracing::debug!(
            "{}: {} keep rules across {} flow directions ({} candidates discarded)",
            capture.display(),
            output.rules.rule_count(),
            output.rules.flow_count(),
            output.rules.stats().candidates_discarded
        );
        Ok(output)
    }
}

/// Cross-segment record state for one flow direction.
#[derive(Default)]
struct DirectionWalk {
    seq: SeqState,
    pending: Option<PendingRecord>,
}

/// A record whose declared length spans past its starting segment.
struct PendingRecord {
    kind: RuleKind,
    remaining: usize,
    /// Whole-record policies keep fragments; ApplicationData fragments
    /// contribute nothing.
    keep_fragments: bool,
}

fn rule_kind(content_type: TlsContentType) -> RuleKind {
    match content_type {
        TlsContentType::Handshake => RuleKind::Handshake,
        TlsContentType::Alert => RuleKind::Alert,
        TlsContentType::ChangeCipherSpec => RuleKind::ChangeCipherSpec,
        TlsContentType::ApplicationData => RuleKind::ApplicationData,
        TlsContentType::Heartbeat => RuleKind::Heartbeat,
        TlsContentType::Unknown(_) => RuleKind::Other,
    }
}

/// Consumes the first unclaimed record claim of the given type.
fn take_claim(claims: &mut Vec<RecordClaim>, content_type: TlsContentType) -> Option<RecordClaim> {
    let pos = claims.iter().position(|c| c.content_type == content_type)?;
    Some(claims.remove(pos))
}

/// Walks one segment's payload, emitting rules into `rules`.
#[allow(clippy::too_many_arguments)]
fn walk_segment(
    policy: &TlsPolicy,
    walk: &mut DirectionWalk,
    flow: FlowKey,
    payload: &[u8],
    logical_start: u64,
    claims: &mut Vec<RecordClaim>,
    rules: &mut KeepRuleSet,
    diagnostics: &mut Vec<String>,
) {
    let mut offset = 0usize;

    // A record left open by earlier segments swallows the front of this
    // one.
    if let Some(pending) = walk.pending.take() {
        let take = pending.remaining.min(payload.len());
        if pending.keep_fragments && take > 0 {
            if let Ok(rule) = KeepRule::full(logical_start, logical_start + take as u64, pending.kind) {
                rules.push(flow, rule);
            }
        }
        let remaining = pending.remaining - take;
        if remaining > 0 {
            walk.pending = Some(PendingRecord { remaining, ..pending });
            return;
        }
        offset = take;
    }

    while offset + TLS_RECORD_HEADER_LEN <= payload.len() {
        let header = TlsRecordHeader::parse(&payload[offset..]).expect("length checked");
        if !header.is_plausible() {
            rules.record_discard();
            diagnostics.push(format!(
                "{}: no plausible record header at segment offset {}; masking remainder",
                flow, offset
            ));
            return;
        }

        // Validate against the external parser's claim when one exists for
        // this record type; a typeless walk still passes the byte gates.
        let claimed = take_claim(claims, header.content_type);
        let claimed_type = claimed
            .as_ref()
            .map(|c| c.content_type)
            .unwrap_or(header.content_type);
        if let Err(e) = header.validate_claim(claimed_type) {
            rules.record_discard();
            diagnostics.push(format!("{}: {}", flow, e));
            return;
        }
        if let Some(declared) = claimed.as_ref().and_then(|c| c.declared_len) {
            if declared != header.length {
                rules.record_discard();
                diagnostics.push(format!(
                    "{}: tool declared {} body bytes, header says {}",
                    flow, declared, header.length
                ));
                return;
            }
        }

        let record_policy = policy.policy_for(header.content_type);
        let kind = rule_kind(header.content_type);
        let body_len = usize::from(header.length);
        let body_in_segment = body_len.min(payload.len() - offset - TLS_RECORD_HEADER_LEN);
        let rule_start = logical_start + offset as u64;

        let rule = if record_policy.keep_body {
            KeepRule::full(
                rule_start,
                rule_start + (TLS_RECORD_HEADER_LEN + body_in_segment) as u64,
                kind,
            )
        } else {
            KeepRule::header_only(rule_start, rule_start + TLS_RECORD_HEADER_LEN as u64, kind)
        };
        match rule {
            Ok(rule) => rules.push(flow, rule),
            Err(e) => {
                rules.record_discard();
                diagnostics.push(format!("{}: {}", flow, e));
                return;
            }
        }

        let remaining = body_len - body_in_segment;
        if remaining > 0 {
            walk.pending = Some(PendingRecord {
                kind,
                remaining,
                keep_fragments: record_policy.keep_body,
            });
            return;
        }
        offset += TLS_RECORD_HEADER_LEN + body_in_segment;
    }

    if offset < payload.len() {
        // A few trailing bytes too short for a record header; they stay
        // masked.
        diagnostics.push(format!(
            "{}: {} trailing bytes shorter than a record header",
            flow,
            payload.len() - offset
        ));
    }
}
