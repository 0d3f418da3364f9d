// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # PktMask Binary
//!
//! Composition root: validated CLI in, sanitised captures and an exit code
//! out. The enterprise layers never see clap, signals, or stdout - they
//! are wired here and narrate through progress events.

use std::sync::Arc;

use byte_unit::{Byte, UnitType};
use pktmask::application::services::{DirectoryProcessor, RunSummary};
use pktmask::infrastructure::config::{FallbackMode, PktMaskConfig};
use pktmask::infrastructure::marker::tshark::detect_tshark;
use pktmask_bootstrap::cli::ValidatedCli;
use pktmask_bootstrap::shutdown::{ShutdownController, DEFAULT_GRACE_PERIOD_SECS};
use pktmask_bootstrap::{signals, ExitCode};
use pktmask_domain::{PktMaskError, ProgressEvent, ProgressSink};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = match pktmask_bootstrap::bootstrap_cli() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("pktmask: {}", e);
            return ExitCode::UsageError.into();
        }
    };
    pktmask_bootstrap::logger::init(cli.verbose);

    match run(cli).await {
        Ok(code) => code.into(),
        Err(e) => {
            tracing::error!("{}", e);
            exit_code_for(&e).into()
        }
    }
}

async fn run(cli: ValidatedCli) -> Result<ExitCode, PktMaskError> {
    let mut config = PktMaskConfig::load(cli.config.as_deref())?;
    config.apply_toggles(cli.no_dedup, cli.no_anon, cli.no_mask);

    // Surface a missing external parser before the run, not on file one.
    if config.mask_payloads.enabled {
        match detect_tshark() {
            Ok(version) => tracing::info!("external parser: {}", version),
            Err(e) if config.mask_payloads.error_recovery.fallback_mode == FallbackMode::Abort => {
                return Err(e);
            }
            Err(e) => tracing::warn!("{}; masking will degrade to copy_original", e),
        }
    }

    let controller = ShutdownController::new();
    signals::install(&controller);
    spawn_grace_watchdog(&controller);

    let processor = DirectoryProcessor::new(
        config,
        progress_sink(),
        controller.stage_flag(),
        cli.workers,
    )?;
    let summary = {
        let _work = controller.work_guard();
        processor.run(&cli.input, &cli.output).await?
    };
    report(&summary);

    Ok(if summary.cancelled {
        ExitCode::Interrupted
    } else if summary.any_failed() {
        ExitCode::Error
    } else {
        ExitCode::Success
    })
}

/// After a stop request, give the file in flight a grace period to wind
/// down; a run still holding work past that (a wedged external parser, a
/// dead mount) is cut off rather than waited on forever.
fn spawn_grace_watchdog(controller: &ShutdownController) {
    let controller = controller.clone();
    tokio::spawn(async move {
        controller.stopped().await;
        let grace = std::time::Duration::from_secs(DEFAULT_GRACE_PERIOD_SECS);
        if !controller.drain(grace).await {
            tracing::error!("pipeline did not wind down within {:?}; exiting", grace);
            std::process::exit(ExitCode::Interrupted.as_i32());
        }
    });
}

/// Progress events to the log; nothing here blocks.
fn progress_sink() -> ProgressSink {
    Arc::new(|event| match event {
        ProgressEvent::FileStart { path, index, total } => {
            tracing::info!("[{}/{}] {}", index + 1, total, path.display());
        }
        ProgressEvent::StageEnd { stage, stats, .. } => {
            tracing::debug!(
                "  {} done: {} packets, {} modified in {:.1?}",
                stage,
                stats.packets_processed,
                stats.packets_modified,
                stats.duration
            );
        }
        ProgressEvent::Error { file, stage, kind, detail } => {
            tracing::warn!("{} [{}] {}: {}", file.display(), stage, kind, detail);
        }
        _ => {}
    })
}

/// The human summary on stdout; logs stay on stderr.
fn report(summary: &RunSummary) {
    let mut bytes_zeroed: u64 = 0;
    let mut packets: u64 = 0;
    for result in &summary.results {
        packets += result.packets_in();
        if let Some(mask) = result.stage("mask_payloads") {
            bytes_zeroed += mask.extra_u64("bytes_zeroed").unwrap_or(0);
        }
        let status = if result.success { "ok    " } else { "FAILED" };
        println!(
            "{} {} -> {}",
            status,
            result.input_path.display(),
            result.output_path.display()
        );
        for error in &result.errors {
            println!("       {}", error);
        }
    }
    let zeroed = Byte::from_u64(bytes_zeroed).get_appropriate_unit(UnitType::Decimal);
    println!(
        "{} file(s) ok, {} failed, {} packets, {:.1} masked{}",
        summary.succeeded,
        summary.failed,
        packets,
        zeroed,
        if summary.cancelled { " (cancelled)" } else { "" }
    );
}

fn exit_code_for(e: &PktMaskError) -> ExitCode {
    match e.category() {
        "configuration" => ExitCode::Config,
        "input" => ExitCode::NoInput,
        "codec" => ExitCode::DataError,
        "marker" => ExitCode::Unavailable,
        "io" => ExitCode::IoError,
        "cancellation" => ExitCode::Interrupted,
        "internal" => ExitCode::Software,
        _ => ExitCode::Error,
    }
}
