// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Per-File Pipeline Executor
//!
//! Drives the configured stage list over one capture file inside a private
//! scratch directory. Stage *i* reads stage *i−1*'s output; a disabled
//! stage degrades to a hard link (copy when linking fails) so downstream
//! stages always see a valid capture and the pipeline contract never
//! changes shape.
//!
//! ## Atomicity
//!
//! No stage ever writes to the final output path. The last stage writes
//! into the scratch directory like every other, and only a fully
//! successful run publishes the result - by rename when the scratch
//! directory shares a filesystem with the destination (it is created next
//! to it precisely for that), by copy + rename otherwise. On any failure
//! the scratch directory is dropped and the output path is untouched.
//!
//! ## Events
//!
//! `file_start`, `stage_start`, `stage_end`, `file_end` and `error` events
//! narrate the run through the installed [`ProgressSink`]; consumers must
//! not block in the callback.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use pktmask_domain::{
    PktMaskError, ProcessResult, ProgressEvent, ProgressSink, StageContext, StageService, StageStats,
};

/// One slot in the configured pipeline: a live stage or a disabled one
/// that passes its input through untouched.
#[derive(Clone)]
pub enum PipelineStage {
    Active(Arc<dyn StageService>),
    Disabled(&'static str),
}

impl PipelineStage {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineStage::Active(stage) => stage.name(),
            PipelineStage::Disabled(name) => name,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, PipelineStage::Active(_))
    }
}

/// Executes the stage chain for single files.
pub struct FilePipeline {
    stages: Vec<PipelineStage>,
    events: ProgressSink,
}

impl FilePipeline {
    pub fn new(stages: Vec<PipelineStage>, events: ProgressSink) -> Self {
        Self { stages, events }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(PipelineStage::name).collect()
    }

    /// Runs every stage over `input`, publishing to `output` only on
    /// success. Never panics; all failure detail lands on the returned
    /// [`ProcessResult`].
    pub fn process_file(
        &self,
        input: &Path,
        output: &Path,
        index: usize,
        total: usize,
        ctx: &mut StageContext,
    ) -> ProcessResult {
        let started = Instant::now();
        let mut result = ProcessResult::started(input.to_path_buf(), output.to_path_buf());
        (self.events)(&ProgressEvent::FileStart {
            path: input.to_path_buf(),
            index,
            total,
        });

        let outcome = self.run_stages(input, output, ctx, &mut result);
        let success = match outcome {
            Ok(()) => true,
            Err(e) => {
                result.record_error(&e);
                false
            }
        };
        result.finish(success, started.elapsed());
        (self.events)(&ProgressEvent::FileEnd {
            path: input.to_path_buf(),
            success,
            stats: result.stage_stats.clone(),
        });
        result
    }

    fn run_stages(
        &self,
        input: &Path,
        output: &Path,
        ctx: &mut StageContext,
        result: &mut ProcessResult,
    ) -> Result<(), PktMaskError> {
        let emit_error = |stage: &str, e: &PktMaskError| {
            (self.events)(&ProgressEvent::Error {
                file: input.to_path_buf(),
                stage: stage.to_string(),
                kind: e.category().to_string(),
                detail: e.to_string(),
            });
        };

        // Scratch lives next to the output so the final publish is a
        // rename on the common path.
        let scratch = match output.parent() {
            Some(parent) if parent.as_os_str().is_empty() => tempfile::tempdir(),
            Some(parent) => tempfile::TempDir::with_prefix_in(".pktmask-", parent),
            None => tempfile::tempdir(),
        }
        .map_err(|e| PktMaskError::io_error(format!("scratch directory: {}", e)))
        .inspect_err(|e| emit_error("", e))?;

        let mut current = input.to_path_buf();
        for (i, stage) in self.stages.iter().enumerate() {
            ctx.check_cancelled()?;
            let stage_output = scratch
                .path()
                .join(format!("{:02}_{}.pcap", i + 1, stage.name()));
            (self.events)(&ProgressEvent::StageStart {
                file: input.to_path_buf(),
                stage: stage.name().to_string(),
            });

            let stats = match stage {
                PipelineStage::Active(service) => {
                    match service.process_capture(&current, &stage_output, ctx) {
                        Ok(stats) => stats,
                        Err(e) => {
                            emit_error(stage.name(), &e);
                            return Err(e);
                        }
                    }
                }
                PipelineStage::Disabled(name) => {
                    pass_through(&current, &stage_output).inspect_err(|e| emit_error(name, e))?;
                    let mut stats = StageStats::new(*name);
                    stats.set_extra("passthrough", true);
                    stats
                }
            };

            (self.events)(&ProgressEvent::StageEnd {
                file: input.to_path_buf(),
                stage: stage.name().to_string(),
                stats: stats.clone(),
            });
            result.record_stage(stats);
            current = stage_output;
        }

        ctx.check_cancelled()?;
        publish(&current, input, output).inspect_err(|e| emit_error("", e))
        // Scratch (and any partial stage outputs) drop here, success or
        // not.
    }
}

/// A disabled stage's output: a hard link when the filesystem allows it,
/// a copy otherwise.
fn pass_through(input: &Path, output: &Path) -> Result<(), PktMaskError> {
    if std::fs::hard_link(input, output).is_ok() {
        return Ok(());
    }
    std::fs::copy(input, output)
        .map(|_| ())
        .map_err(|e| PktMaskError::io_error(format!("pass-through copy: {}", e)))
}

/// Atomically publishes the final stage output. When every stage was
/// disabled `current` may still be a link to the input itself; publishing
/// then copies so the input file is never moved.
fn publish(current: &Path, input: &Path, output: &Path) -> Result<(), PktMaskError> {
    if current == input {
        // No stages configured at all.
        std::fs::copy(input, output)
            .map(|_| ())
            .map_err(|e| PktMaskError::io_error(format!("publish copy: {}", e)))?;
        return Ok(());
    }
    if std::fs::rename(current, output).is_ok() {
        return Ok(());
    }
    // Cross-device: copy into place via a temporary sibling, then rename.
    let tmp = output.with_extension("pcap.partial");
    std::fs::copy(current, &tmp)
        .map_err(|e| PktMaskError::io_error(format!("publish copy: {}", e)))?;
    std::fs::rename(&tmp, output).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        PktMaskError::io_error(format!("publish rename: {}", e))
    })
}
