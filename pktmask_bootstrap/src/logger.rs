// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Process Logging Initialisation
//!
//! One-shot tracing-subscriber setup for the whole process. Verbosity comes
//! from the CLI's `-v` count; an explicit `RUST_LOG` always wins so
//! operators can focus on a single module (`RUST_LOG=pktmask::marker=trace`)
//! without drowning in the packet loop.
//!
//! Output goes to stderr: stdout belongs to the run summary.

use tracing_subscriber::EnvFilter;

/// Maps the `-v` count to a default filter directive.
fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Initialises the global tracing subscriber.
///
/// Safe to call once per process; later calls are ignored (the first
/// subscriber stays installed), which keeps tests that initialise logging
/// independently from panicking.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
        .try_init();
}
