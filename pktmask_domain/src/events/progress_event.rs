// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Progress Events
//!
//! The executor narrates its work through typed events: file boundaries,
//! stage boundaries with their statistics, and errors with their category.
//! Consumers receive them on the executor's thread and must handle them
//! without blocking; anything slow (rendering, network) belongs on the
//! consumer's side of a channel.

use crate::entities::stage_stats::StageStats;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// A progress event emitted by the pipeline executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    FileStart {
        path: PathBuf,
        /// Zero-based position within the run.
        index: usize,
        total: usize,
    },
    StageStart {
        file: PathBuf,
        stage: String,
    },
    StageEnd {
        file: PathBuf,
        stage: String,
        stats: StageStats,
    },
    FileEnd {
        path: PathBuf,
        success: bool,
        stats: Vec<StageStats>,
    },
    Error {
        file: PathBuf,
        /// Stage name, or empty when the error is file-scoped.
        stage: String,
        kind: String,
        detail: String,
    },
}

/// Non-blocking event consumer shared across the run.
pub type ProgressSink = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// A sink that discards every event; the default when the host installs
/// nothing.
pub fn null_sink() -> ProgressSink {
    Arc::new(|_| {})
}
