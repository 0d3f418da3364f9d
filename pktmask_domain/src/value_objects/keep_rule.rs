// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Keep Rules
//!
//! A [`KeepRule`] is a half-open byte range in a flow direction's 64-bit
//! logical sequence space that must survive masking verbatim. The marker
//! produces them; the masker zeroes everything outside them. A
//! [`KeepRuleSet`] holds all rules for one file, grouped per directional
//! flow, sorted and non-overlapping after [`KeepRuleSet::normalize`].
//!
//! Rules carry two tags. The [`RuleKind`] names the TLS record type that
//! produced the rule and exists for statistics. The [`MergeClass`] is what
//! normalisation respects: ranges that keep a whole record and ranges that
//! keep only a 5-byte header are never folded together, so the rule set
//! stays auditable against the record structure that produced it.
//!
//! ## Lookup
//!
//! Per flow direction the rules are a sorted `Vec`; the masker asks for the
//! rules overlapping one segment window. The lookup is a binary search for
//! the first rule ending after the window start, then a linear scan while
//! rules start before the window end: `O(log n + k)` with `k` usually ≤ 2.

use crate::error::PktMaskError;
use crate::value_objects::flow_key::{FlowKey, TwoWayFlowKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// The TLS record type a keep rule came from. Statistics only.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub enum RuleKind {
    Handshake,
    Alert,
    ChangeCipherSpec,
    ApplicationData,
    Heartbeat,
    Other,
}

impl RuleKind {
    pub fn label(&self) -> &'static str {
        match self {
            RuleKind::Handshake => "handshake",
            RuleKind::Alert => "alert",
            RuleKind::ChangeCipherSpec => "change_cipher_spec",
            RuleKind::ApplicationData => "application_data",
            RuleKind::Heartbeat => "heartbeat",
            RuleKind::Other => "other",
        }
    }
}

/// Merge compatibility: whole-record ranges and header-only ranges never
/// merge with each other.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub enum MergeClass {
    FullRecord,
    HeaderOnly,
}

/// A half-open `[start, end)` byte range, in logical sequence space, that
/// must be preserved verbatim in one flow direction.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct KeepRule {
    pub start: u64,
    pub end: u64,
    pub kind: RuleKind,
    pub class: MergeClass,
}

impl KeepRule {
    /// A rule preserving a whole record (or a fragment of one).
    pub fn full(start: u64, end: u64, kind: RuleKind) -> Result<Self, PktMaskError> {
        Self::new(start, end, kind, MergeClass::FullRecord)
    }

    /// A rule preserving only a record header.
    pub fn header_only(start: u64, end: u64, kind: RuleKind) -> Result<Self, PktMaskError> {
        Self::new(start, end, kind, MergeClass::HeaderOnly)
    }

    fn new(start: u64, end: u64, kind: RuleKind, class: MergeClass) -> Result<Self, PktMaskError> {
        if start >= end {
            return Err(PktMaskError::RuleValidation(format!(
                "empty or inverted keep range [{}, {})",
                start, end
            )));
        }
        Ok(Self { start, end, kind, class })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// True when this rule intersects the half-open window.
    pub fn overlaps(&self, win_start: u64, win_end: u64) -> bool {
        self.start < win_end && self.end > win_start
    }

    /// The key this rule is counted under in statistics.
    pub fn stat_label(&self) -> String {
        match self.class {
            MergeClass::FullRecord => self.kind.label().to_string(),
            MergeClass::HeaderOnly => format!("{}_header", self.kind.label()),
        }
    }
}

/// Summary statistics of a rule set, reported in `StageStats.extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSetStats {
    /// Emitted rules per rule kind label.
    pub rules_by_kind: BTreeMap<String, u64>,
    /// Rules folded away by normalisation.
    pub rules_merged: u64,
    /// Candidate rules discarded by validation gates.
    pub candidates_discarded: u64,
}

/// All keep rules for one capture file.
///
/// Owned by the masker for the duration of a file; immutable once the
/// marker has handed it over (enforced by value flow, not locking).
#[derive(Debug, Clone, Default)]
pub struct KeepRuleSet {
    rules: HashMap<FlowKey, Vec<KeepRule>>,
    flows: HashSet<TwoWayFlowKey>,
    stats: RuleSetStats,
    normalized: bool,
}

impl KeepRuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a rule for a flow direction. Invalidates normalisation.
    pub fn push(&mut self, flow: FlowKey, rule: KeepRule) {
        *self
            .stats
            .rules_by_kind
            .entry(rule.stat_label())
            .or_insert(0) += 1;
        self.flows.insert(flow.into());
        self.rules.entry(flow).or_default().push(rule);
        self.normalized = false;
    }

    /// Marks a flow as known to the rule set even when no rule survived for
    /// it; the masker masks (rather than passes through) such flows.
    pub fn mark_flow(&mut self, flow: FlowKey) {
        self.flows.insert(flow.into());
    }

    /// Records a candidate rule rejected by a validation gate.
    pub fn record_discard(&mut self) {
        self.stats.candidates_discarded += 1;
    }

    /// Sorts every per-flow rule list and folds overlapping or adjacent
    /// ranges of the same merge class. Ranges of different classes that
    /// overlap are trimmed rather than merged; the kept byte set (the union
    /// of all ranges) is unchanged by normalisation.
    pub fn normalize(&mut self) {
        for rules in self.rules.values_mut() {
            rules.sort_by_key(|r| (r.start, r.end));
            let mut merged: Vec<KeepRule> = Vec::with_capacity(rules.len());
            for rule in rules.drain(..) {
                match merged.last_mut() {
                    Some(prev) if rule.start <= prev.end => {
                        if rule.class == prev.class {
                            if rule.end > prev.end {
                                prev.end = rule.end;
                            }
                            self.stats.rules_merged += 1;
                        } else if rule.end > prev.end {
                            // Overlap across classes: trim to keep ranges
                            // disjoint without shrinking the union.
                            let prev_end = prev.end;
                            merged.push(KeepRule {
                                start: prev_end,
                                ..rule
                            });
                        } else {
                            // Fully contained in the previous range.
                            self.stats.rules_merged += 1;
                        }
                    }
                    _ => merged.push(rule),
                }
            }
            *rules = merged;
        }
        self.normalized = true;
    }

    /// The sorted rules for one flow direction, empty if none.
    pub fn rules_for(&self, flow: &FlowKey) -> &[KeepRule] {
        self.rules.get(flow).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The sub-slice of rules overlapping `[win_start, win_end)` for one
    /// flow direction. Requires a normalised set.
    pub fn overlapping(&self, flow: &FlowKey, win_start: u64, win_end: u64) -> &[KeepRule] {
        debug_assert!(self.normalized, "rule lookup on an unnormalised set");
        let rules = self.rules_for(flow);
        // First rule that ends after the window start...
        let lo = rules.partition_point(|r| r.end <= win_start);
        // ...then every rule starting before the window end.
        let mut hi = lo;
        while hi < rules.len() && rules[hi].start < win_end {
            hi += 1;
        }
        &rules[lo..hi]
    }

    /// True when the rule set knows this conversation in either direction.
    pub fn covers_flow(&self, flow: &FlowKey) -> bool {
        self.flows.contains(&TwoWayFlowKey::from(*flow))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.values().all(Vec::is_empty) && self.flows.is_empty()
    }

    /// Number of directional flows carrying at least one rule.
    pub fn flow_count(&self) -> usize {
        self.rules.len()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.values().map(Vec::len).sum()
    }

    pub fn stats(&self) -> &RuleSetStats {
        &self.stats
    }
}
