// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # External Deep-Parser Integration
//!
//! The TLS marker does not reimplement a dissector; it shells out to
//! `tshark` and re-validates everything it says against the capture bytes.
//! This module owns the subprocess boundary:
//!
//! - **Detection**: `tshark --version` probed once per process and cached,
//!   so a missing deployment surfaces at startup, not mid-run.
//! - **Invocation**: `-T json` with explicit `-e` field selectors and TCP
//!   desegmentation disabled, so record claims land on the segment whose
//!   payload carries the record header - the shape the marker's
//!   cross-segment logic expects.
//! - **Lifecycle**: output is spooled to temp files (no pipe deadlocks),
//!   the child is polled with a configurable timeout and killed on timeout
//!   or cancellation.
//! - **Parsing**: lenient JSON traversal; unknown fields are ignored, so
//!   newer tshark releases that add fields keep working.
//!
//! Everything returned here is a *claim*. Offsets, lengths and content
//! types are re-checked against segment bytes before any keep rule exists.

use once_cell::sync::OnceCell;
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use pktmask_domain::services::tls_policy::TlsContentType;
use pktmask_domain::{PktMaskError, StageContext};

/// How often the child is polled while waiting.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One TLS record the external parser claims exists.
#[derive(Debug, Clone)]
pub struct RecordClaim {
    pub content_type: TlsContentType,
    /// Declared record body length, when the tool reported one.
    pub declared_len: Option<u16>,
}

/// Everything the external parser claimed about one capture: per-frame
/// record claims, keyed by 1-based frame number.
#[derive(Debug, Clone, Default)]
pub struct TsharkScan {
    pub claims: BTreeMap<u64, Vec<RecordClaim>>,
}

impl TsharkScan {
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}

static TSHARK_PROBE: OnceCell<Result<String, String>> = OnceCell::new();

/// Probes for the external parser once per process.
///
/// Returns the version banner line, or `MarkerUnavailable` with a clear
/// diagnostic when the binary is missing or refuses to run.
pub fn detect_tshark() -> Result<String, PktMaskError> {
    let probe = TSHARK_PROBE.get_or_init(|| {
        match Command::new("tshark")
            .arg("--version")
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
        {
            Ok(out) if out.status.success() => {
                let banner = String::from_utf8_lossy(&out.stdout)
                    .lines()
                    .next()
                    .unwrap_or("tshark")
                    .to_string();
                Ok(banner)
            }
            Ok(out) => Err(format!("tshark --version exited with {}", out.status)),
            Err(e) => Err(format!("tshark not runnable: {}", e)),
        }
    });
    probe
        .clone()
        .map_err(|e| PktMaskError::MarkerUnavailable(format!("{} (install Wireshark/tshark)", e)))
}

/// Runs the external parser over one capture file.
pub struct TsharkRunner {
    timeout: Duration,
}

impl TsharkRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Invokes tshark over `capture` and parses its record claims.
    ///
    /// # Errors
    ///
    /// - `MarkerUnavailable` when the binary is missing
    /// - `Timeout` when the configured deadline passes (child is killed)
    /// - `Cancelled` when the run is cancelled (child is killed)
    /// - `MarkerError` when the child fails or emits unparseable output
    pub fn scan(&self, capture: &Path, ctx: &StageContext) -> Result<TsharkScan, PktMaskError> {
        detect_tshark()?;

        let stdout_file = tempfile::NamedTempFile::new()?;
        let stderr_file = tempfile::NamedTempFile::new()?;

        let mut child = Command::new("tshark")
            .arg("-r")
            .arg(capture)
            .args(["-Y", "tls", "-T", "json"])
            .args(["-e", "frame.number"])
            .args(["-e", "tls.record.content_type"])
            .args(["-e", "tls.record.opaque_type"])
            .args(["-e", "tls.record.length"])
            .args(["-e", "tls.record.version"])
            .args(["-o", "tcp.desegment_tcp_streams:FALSE"])
            .stdin(Stdio::null())
            .stdout(stdout_file.reopen()?)
            .stderr(stderr_file.reopen()?)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    PktMaskError::MarkerUnavailable("tshark disappeared from PATH".into())
                } else {
                    PktMaskError::marker_error(format!("failed to spawn tshark: {}", e))
                }
            })?;

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child
                .try_wait()
                .map_err(|e| PktMaskError::marker_error(format!("waiting for tshark: {}", e)))?
            {
                break status;
            }
            if ctx.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(PktMaskError::cancelled("marker interrupted"));
            }
            if started.elapsed() > self.timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(PktMaskError::Timeout(format!(
                    "tshark exceeded {}s on {}",
                    self.timeout.as_secs(),
                    capture.display()
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        if !status.success() {
            let mut stderr = String::new();
            let _ = stderr_file.reopen()?.read_to_string(&mut stderr);
            let excerpt: String = stderr.lines().take(3).collect::<Vec<_>>().join("; ");
            return Err(PktMaskError::marker_error(format!(
                "tshark exited with {}: {}",
                status, excerpt
            )));
        }

        let mut raw = String::new();
        stdout_file.reopen()?.read_to_string(&mut raw)?;
        parse_scan(&raw)
    }
}

/// Parses `tshark -T json -e ...` output into record claims.
///
/// The JSON shape is an array of frames, each with
/// `_source.layers.<field>` holding an array of string values. Anything
/// unexpected is skipped rather than fatal - the bytes re-validate every
/// claim later anyway - except a top level that is not JSON at all.
fn parse_scan(raw: &str) -> Result<TsharkScan, PktMaskError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        // No frame matched the display filter: a capture without TLS.
        return Ok(TsharkScan::default());
    }
    let value: Value = serde_json::from_str(trimmed)?;
    let mut scan = TsharkScan::default();
    let Some(frames) = value.as_array() else {
        return Err(PktMaskError::marker_error(
            "tshark output is not a frame array",
        ));
    };

    for frame in frames {
        let Some(layers) = frame.pointer("/_source/layers") else {
            continue;
        };
        let Some(frame_no) = first_string(layers, "frame.number").and_then(|s| s.parse::<u64>().ok())
        else {
            continue;
        };

        let mut types: Vec<u8> = strings(layers, "tls.record.content_type")
            .iter()
            .filter_map(|s| s.parse::<u8>().ok())
            .collect();
        // TLS 1.3 reports the outer (opaque) type separately.
        types.extend(
            strings(layers, "tls.record.opaque_type")
                .iter()
                .filter_map(|s| s.parse::<u8>().ok()),
        );
        let lengths: Vec<u16> = strings(layers, "tls.record.length")
            .iter()
            .filter_map(|s| s.parse::<u16>().ok())
            .collect();

        if types.is_empty() {
            continue;
        }
        let claims: Vec<RecordClaim> = types
            .iter()
            .enumerate()
            .map(|(i, t)| RecordClaim {
                content_type: TlsContentType::from_u8(*t),
                // Lengths align with types only when the tool reported one
                // per record; otherwise they stay unknown and the in-band
                // header is authoritative.
                declared_len: (lengths.len() == types.len()).then(|| lengths[i]),
            })
            .collect();
        scan.claims.entry(frame_no).or_default().extend(claims);
    }
    Ok(scan)
}

fn strings<'a>(layers: &'a Value, field: &str) -> Vec<&'a str> {
    layers
        .get(field)
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

fn first_string<'a>(layers: &'a Value, field: &str) -> Option<&'a str> {
    strings(layers, field).first().copied()
}
