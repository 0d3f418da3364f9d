// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # CLI Parsing and Validation
//!
//! Clap-based argument parsing plus the validation pass that turns raw
//! arguments into a [`ValidatedCli`] the application can trust: the input
//! exists, the worker count is sane, and relative paths do not traverse
//! upward out of the invocation directory.
//!
//! Stage toggles (`--no-dedup`, `--no-anon`, `--no-mask`) override the
//! configuration file; absent flags leave the file's values in force.

use clap::Parser;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Maximum accepted worker count; above this the thread pool stops paying.
pub const MAX_WORKERS: usize = 64;

/// Errors produced by CLI parsing and validation.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("input path does not exist: {0}")]
    InputMissing(PathBuf),

    #[error("input path is neither a file nor a directory: {0}")]
    InputInvalid(PathBuf),

    #[error("config file does not exist: {0}")]
    ConfigMissing(PathBuf),

    #[error("worker count {0} out of range (1-{MAX_WORKERS})")]
    WorkersOutOfRange(usize),

    #[error("path traverses outside the working directory: {0}")]
    PathTraversal(PathBuf),
}

/// PktMask - offline batch sanitiser for packet captures.
///
/// Removes duplicate packets, pseudonymises IP addresses, and zeroes
/// application-layer payloads while preserving protocol framing.
#[derive(Parser, Debug, Clone)]
#[command(name = "pktmask", version, about, long_about = None)]
pub struct Cli {
    /// Input capture file or directory of captures
    pub input: PathBuf,

    /// Output directory (created if absent)
    #[arg(short, long, default_value = "pktmask-output")]
    pub output: PathBuf,

    /// Configuration file (TOML); defaults apply when omitted
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Number of files processed concurrently
    #[arg(short, long, default_value_t = 1)]
    pub workers: usize,

    /// Disable the duplicate-removal stage
    #[arg(long)]
    pub no_dedup: bool,

    /// Disable the IP anonymisation stage
    #[arg(long)]
    pub no_anon: bool,

    /// Disable the payload-masking stage
    #[arg(long)]
    pub no_mask: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Arguments that passed validation.
#[derive(Debug, Clone)]
pub struct ValidatedCli {
    pub input: PathBuf,
    pub output: PathBuf,
    pub config: Option<PathBuf>,
    pub workers: usize,
    pub no_dedup: bool,
    pub no_anon: bool,
    pub no_mask: bool,
    pub verbose: u8,
}

/// A relative path may not step above its starting point.
fn rejects_traversal(path: &Path) -> bool {
    if path.is_absolute() {
        return false;
    }
    let mut depth: i64 = 0;
    for component in path.components() {
        match component {
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return true;
                }
            }
            Component::Normal(_) => depth += 1,
            _ => {}
        }
    }
    false
}

/// Validates parsed arguments.
pub fn validate(cli: Cli) -> Result<ValidatedCli, ParseError> {
    if !cli.input.exists() {
        return Err(ParseError::InputMissing(cli.input));
    }
    if !cli.input.is_file() && !cli.input.is_dir() {
        return Err(ParseError::InputInvalid(cli.input));
    }
    if let Some(config) = &cli.config {
        if !config.is_file() {
            return Err(ParseError::ConfigMissing(config.clone()));
        }
    }
    if cli.workers == 0 || cli.workers > MAX_WORKERS {
        return Err(ParseError::WorkersOutOfRange(cli.workers));
    }
    if rejects_traversal(&cli.output) {
        return Err(ParseError::PathTraversal(cli.output));
    }

    Ok(ValidatedCli {
        input: cli.input,
        output: cli.output,
        config: cli.config,
        workers: cli.workers,
        no_dedup: cli.no_dedup,
        no_anon: cli.no_anon,
        no_mask: cli.no_mask,
        verbose: cli.verbose,
    })
}

/// Parses the process arguments and validates them.
pub fn parse_and_validate() -> Result<ValidatedCli, ParseError> {
    validate(Cli::parse())
}
