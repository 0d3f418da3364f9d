// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Directory Controller
//!
//! Turns one invocation into a run: discovers input captures in a
//! deterministic order, performs the anonymisation pre-scan that builds
//! the shared [`IpMap`] before any per-file work starts, then processes
//! files - sequentially by default, or with a bounded number of blocking
//! workers when asked. Results are reported in input order regardless of
//! completion order.
//!
//! Cross-file state is exactly what the design allows to be shared: the
//! read-only `IpMap` and the aggregated run summary. A failure in one file
//! is recorded and the run continues; cancellation stops new files from
//! starting and lets the file in flight wind down.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::Semaphore;

use pktmask_domain::{IpMapBuilder, PktMaskError, ProcessResult, ProgressSink, StageContext};

use crate::application::services::file_pipeline::{FilePipeline, PipelineStage};
use crate::infrastructure::config::PktMaskConfig;
use crate::infrastructure::marker::tls_marker::MarkerRegistry;
use crate::infrastructure::runtime::memory::MemoryMonitor;
use crate::infrastructure::stages::{anonymize, AnonymizeStage, DedupStage, MaskStage};

/// Input extensions recognised during directory discovery.
const CAPTURE_EXTENSIONS: [&str; 3] = ["pcap", "pcapng", "cap"];

/// Aggregated outcome of one run.
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Per-file results in input order.
    pub results: Vec<ProcessResult>,
    pub succeeded: usize,
    pub failed: usize,
    /// True when the run stopped early on cancellation.
    pub cancelled: bool,
}

impl RunSummary {
    fn tally(&mut self) {
        self.succeeded = self.results.iter().filter(|r| r.success).count();
        self.failed = self.results.len() - self.succeeded;
    }

    /// Non-zero-exit condition: any file failed.
    pub fn any_failed(&self) -> bool {
        self.failed > 0
    }
}

/// Drives a whole input (file or directory) through the pipeline.
pub struct DirectoryProcessor {
    config: PktMaskConfig,
    pipeline: Arc<FilePipeline>,
    workers: usize,
    cancel: Arc<AtomicBool>,
}

impl DirectoryProcessor {
    /// Wires the stage list from configuration. Fails fast on a protocol
    /// name the compiled-in registry does not know.
    pub fn new(
        config: PktMaskConfig,
        events: ProgressSink,
        cancel: Arc<AtomicBool>,
        workers: usize,
    ) -> Result<Self, PktMaskError> {
        let mut stages = Vec::with_capacity(3);
        stages.push(if config.remove_dupes.enabled {
            PipelineStage::Active(Arc::new(DedupStage::new()))
        } else {
            PipelineStage::Disabled("remove_dupes")
        });
        stages.push(if config.anonymize_ips.enabled {
            PipelineStage::Active(Arc::new(AnonymizeStage::new()))
        } else {
            PipelineStage::Disabled("anonymize_ips")
        });
        stages.push(if config.mask_payloads.enabled {
            let registry = MarkerRegistry::standard(
                config.tls_policy(),
                config.marker_timeout(),
                config.mask_payloads.error_recovery.max_retries,
            );
            let marker = registry.resolve(&config.mask_payloads.protocol)?;
            PipelineStage::Active(Arc::new(MaskStage::new(
                marker,
                config.mask_payloads.error_recovery.fallback_mode,
                config.mask_payloads.masker.batch_size,
                MemoryMonitor::new(config.mask_payloads.masker.memory_limit_mb),
            )))
        } else {
            PipelineStage::Disabled("mask_payloads")
        });

        Ok(Self {
            config,
            pipeline: Arc::new(FilePipeline::new(stages, events)),
            workers: workers.max(1),
            cancel,
        })
    }

    /// Runs the pipeline over every capture under `input`.
    pub async fn run(&self, input: &Path, output_dir: &Path) -> Result<RunSummary, PktMaskError> {
        let files = discover_inputs(input)?;
        if files.is_empty() {
            return Err(PktMaskError::input_error(format!(
                "no capture files under {}",
                input.display()
            )));
        }
        std::fs::create_dir_all(output_dir)
            .map_err(|e| PktMaskError::io_error(format!("{}: {}", output_dir.display(), e)))?;
        let outputs = plan_outputs(&files, output_dir);

        // Directory-scoped pre-scan: the pseudonym map must be complete
        // before the first per-file run so every file sees one table.
        let ip_map = if self.config.anonymize_ips.enabled {
            let a = &self.config.anonymize_ips;
            let mut builder = IpMapBuilder::new(a.method, a.ipv4_prefix, a.ipv6_prefix);
            let scan_files = files.clone();
            let builder = tokio::task::spawn_blocking(move || {
                anonymize::collect_addresses(&scan_files, &mut builder).map(|_| builder)
            })
            .await
            .map_err(|e| PktMaskError::internal_error(format!("pre-scan task: {}", e)))??;
            let map = builder.build();
            tracing::info!(
                "pre-scan complete: {} addresses mapped ({} identity)",
                map.len(),
                map.identity_mapped()
            );
            Some(Arc::new(map))
        } else {
            None
        };

        let total = files.len();
        let mut summary = RunSummary::default();
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut handles = Vec::with_capacity(total);

        for (index, (input_file, output_file)) in files.into_iter().zip(outputs).enumerate() {
            if self.cancel.load(std::sync::atomic::Ordering::SeqCst) {
                summary.cancelled = true;
                break;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| PktMaskError::internal_error(e.to_string()))?;
            let pipeline = self.pipeline.clone();
            let ip_map = ip_map.clone();
            let cancel = self.cancel.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let mut ctx = StageContext::with_cancel(cancel);
                if let Some(map) = ip_map {
                    ctx.set_ip_map(map);
                }
                (index, pipeline.process_file(&input_file, &output_file, index, total, &mut ctx))
            }));
        }

        let mut indexed: Vec<(usize, ProcessResult)> = Vec::with_capacity(handles.len());
        for handle in handles {
            let (index, result) = handle
                .await
                .map_err(|e| PktMaskError::internal_error(format!("worker task: {}", e)))?;
            indexed.push((index, result));
        }
        indexed.sort_by_key(|(index, _)| *index);
        summary.results = indexed.into_iter().map(|(_, r)| r).collect();
        if self.cancel.load(std::sync::atomic::Ordering::SeqCst) {
            summary.cancelled = true;
        }
        summary.tally();
        Ok(summary)
    }
}

/// Finds the capture files for one invocation: a single file as-is, a
/// directory's captures sorted by name for a deterministic run order.
pub fn discover_inputs(input: &Path) -> Result<Vec<PathBuf>, PktMaskError> {
    if input.is_file() {
        return Ok(vec![input.to_path_buf()]);
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(input)
        .map_err(|e| PktMaskError::input_error(format!("{}: {}", input.display(), e)))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|ext| {
                        CAPTURE_EXTENSIONS
                            .iter()
                            .any(|known| ext.eq_ignore_ascii_case(known))
                    })
        })
        .collect();
    files.sort();
    Ok(files)
}

/// One output path per input: the stem with a `.pcap` extension, falling
/// back to the full input name when two inputs would collide (`a.pcap`
/// next to `a.pcapng`).
fn plan_outputs(files: &[PathBuf], output_dir: &Path) -> Vec<PathBuf> {
    let mut taken = std::collections::HashSet::new();
    files
        .iter()
        .map(|input| {
            let stem = input
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("capture");
            let mut candidate = output_dir.join(format!("{}.pcap", stem));
            if !taken.insert(candidate.clone()) {
                let full = input
                    .file_name()
                    .and_then(|s| s.to_str())
                    .unwrap_or("capture");
                candidate = output_dir.join(format!("{}.pcap", full));
                taken.insert(candidate.clone());
            }
            candidate
        })
        .collect()
}
