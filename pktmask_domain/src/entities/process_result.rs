// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Per-file processing result: ordered stage statistics plus the errors
//! that ended the file, if any. One `ProcessResult` exists per input file;
//! the directory controller aggregates them into the run summary.

use crate::entities::stage_stats::StageStats;
use crate::error::PktMaskError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Outcome of one input file's trip through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessResult {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    /// Stage statistics in execution order.
    pub stage_stats: Vec<StageStats>,
    /// Error messages, category-prefixed, in occurrence order.
    pub errors: Vec<String>,
    pub success: bool,
    pub duration: Duration,
    pub completed_at: DateTime<Utc>,
}

impl ProcessResult {
    pub fn started(input_path: PathBuf, output_path: PathBuf) -> Self {
        Self {
            input_path,
            output_path,
            stage_stats: Vec::new(),
            errors: Vec::new(),
            success: false,
            duration: Duration::ZERO,
            completed_at: Utc::now(),
        }
    }

    pub fn record_stage(&mut self, stats: StageStats) {
        self.stage_stats.push(stats);
    }

    pub fn record_error(&mut self, err: &PktMaskError) {
        self.errors.push(format!("{}: {}", err.category(), err));
    }

    pub fn finish(&mut self, success: bool, duration: Duration) {
        self.success = success;
        self.duration = duration;
        self.completed_at = Utc::now();
    }

    /// Total packets read by the first stage (packets in the input file).
    pub fn packets_in(&self) -> u64 {
        self.stage_stats.first().map(|s| s.packets_processed).unwrap_or(0)
    }

    pub fn stage(&self, name: &str) -> Option<&StageStats> {
        self.stage_stats.iter().find(|s| s.stage_name == name)
    }
}
