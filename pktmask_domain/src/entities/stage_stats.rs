// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Stage Statistics
//!
//! Every stage invocation returns a [`StageStats`]: the standardised
//! per-stage outcome the executor records on the file result and forwards
//! through progress events. The `extra` map carries stage-specific counters
//! (dedup drop counts, anonymiser rewrite counts, masker byte counts,
//! format-conversion flags) without widening the common contract; it is a
//! `BTreeMap` so serialised output is stable.
//!
//! The modification counter is exact by contract: a stage only counts a
//! packet as modified when the bytes it wrote differ from the bytes it
//! read.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Standardised per-stage outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageStats {
    /// Stage name as registered with the executor.
    pub stage_name: String,
    /// Packets read from the stage input.
    pub packets_processed: u64,
    /// Packets whose output bytes differ from their input bytes (exact).
    pub packets_modified: u64,
    /// Wall-clock duration of the stage.
    pub duration: Duration,
    /// Stage-specific counters and flags.
    pub extra: BTreeMap<String, String>,
}

impl StageStats {
    pub fn new(stage_name: impl Into<String>) -> Self {
        Self {
            stage_name: stage_name.into(),
            packets_processed: 0,
            packets_modified: 0,
            duration: Duration::ZERO,
            extra: BTreeMap::new(),
        }
    }

    /// Sets an extra counter, stringifying the value.
    pub fn set_extra(&mut self, key: impl Into<String>, value: impl ToString) {
        self.extra.insert(key.into(), value.to_string());
    }

    pub fn extra_u64(&self, key: &str) -> Option<u64> {
        self.extra.get(key).and_then(|v| v.parse().ok())
    }
}

/// Detailed outcome of the payload-masking stage.
///
/// Folded into the masking `StageStats.extra` for reporting; kept as a
/// typed value so tests can assert on it directly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaskingSummary {
    pub packets_processed: u64,
    pub packets_modified: u64,
    pub bytes_zeroed: u64,
    pub bytes_preserved: u64,
    /// Packets absorbed by the per-packet fallback policy.
    pub packets_fallback: u64,
    /// Stage-level fallback that was engaged, if any
    /// (`copy_original` when the marker was unavailable).
    pub fallback_mode: Option<String>,
    /// Capped human-readable diagnostics.
    pub diagnostics: Vec<String>,
}

impl MaskingSummary {
    const MAX_DIAGNOSTICS: usize = 64;

    pub fn diagnose(&mut self, msg: impl Into<String>) {
        if self.diagnostics.len() < Self::MAX_DIAGNOSTICS {
            self.diagnostics.push(msg.into());
        }
    }

    /// Folds the summary into the standard stats shape.
    pub fn apply_to(&self, stats: &mut StageStats) {
        stats.packets_processed = self.packets_processed;
        stats.packets_modified = self.packets_modified;
        stats.set_extra("bytes_zeroed", self.bytes_zeroed);
        stats.set_extra("bytes_preserved", self.bytes_preserved);
        stats.set_extra("packets_fallback", self.packets_fallback);
        if let Some(mode) = &self.fallback_mode {
            stats.set_extra("fallback", mode);
        }
        if !self.diagnostics.is_empty() {
            stats.set_extra("diagnostics", self.diagnostics.len());
        }
    }
}
