// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

// Production code safety enforced via CI and `make lint-strict`
// (lib/bins checked separately from tests - tests may use unwrap/expect)

//! # Bootstrap Module
//!
//! The bootstrap module sits **outside** the enterprise application layers
//! (domain, application, infrastructure) and provides:
//!
//! - **Entry point** - Application lifecycle management
//! - **Signal handling** - Graceful shutdown (SIGTERM, SIGINT, SIGHUP)
//! - **Argument parsing** - CLI argument validation
//! - **Logging init** - tracing subscriber setup for the whole process
//! - **Error handling** - Unix exit code mapping
//! - **Async coordination** - Shutdown coordination and cancellation
//!
//! ## Key Design Principles
//!
//! 1. **Separation from Enterprise Layers**
//!    - Bootstrap can access all layers
//!    - Enterprise layers cannot access bootstrap
//!
//! 2. **Graceful Shutdown**
//!    - Signal handlers (SIGTERM, SIGINT, SIGHUP)
//!    - One stop flag, polled synchronously by the packet loops, plus
//!      in-flight work accounting so a stuck run can be told apart from
//!      one that wound down
//!    - Grace period with timeout enforcement
//!
//! 3. **Validation First**
//!    - Input paths must exist, worker counts are bounded, relative
//!      output paths may not traverse upward
//!
//! ## Module Structure
//!
//! - `cli` - argument parsing and validation
//! - `exit_code` - Unix exit code enumeration
//! - `logger` - process-wide tracing initialisation
//! - `shutdown` - shutdown coordination
//! - `signals` - signal handling (SIGTERM, SIGINT, SIGHUP)

pub mod cli;
pub mod exit_code;
pub mod logger;
pub mod shutdown;
pub mod signals;

// Re-export commonly used types
pub use cli::{parse_and_validate, ValidatedCli};
pub use exit_code::ExitCode;
pub use shutdown::{ShutdownController, WorkGuard};

/// Bootstrap and parse CLI arguments
///
/// This is the main entry point for the bootstrap layer. It handles:
/// 1. CLI parsing with clap
/// 2. Path and bounds validation
/// 3. Returns validated configuration
///
/// The caller is responsible for running the application logic and mapping
/// its result to an exit code.
///
/// # Errors
///
/// Returns `cli::ParseError` if CLI parsing or validation fails. Clap
/// handles `--help` and `--version` automatically and exits the process.
pub fn bootstrap_cli() -> Result<ValidatedCli, cli::ParseError> {
    cli::parse_and_validate()
}
