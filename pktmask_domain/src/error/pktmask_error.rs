// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Domain Error System
//!
//! This module provides the hierarchical error system for the PktMask
//! domain. It categorises failures so that each layer of the pipeline can
//! make its own recovery decision: per-packet errors are absorbed by the
//! masker's fallback policy, per-stage errors abort the stage (and may
//! trigger the stage-level fallback), per-file errors abort the file, and
//! the directory controller continues with the next file.
//!
//! ## Error Categories
//!
//! - **Configuration**: `InvalidConfiguration` - malformed or out-of-range
//!   options, rejected before any stage runs
//! - **Input**: `InputError` - missing, unreadable, or malformed input file
//! - **Codec**: `CodecError` - unsupported capture format or corrupt block
//! - **Marker**: `MarkerUnavailable` (external deep parser missing),
//!   `MarkerError` (crashed or unparseable output), `Timeout`
//! - **Rules**: `RuleValidation` - a candidate keep rule violated bounds or
//!   content-type consistency; the rule is discarded, processing continues
//! - **Masking**: `MaskingError` - per-packet parse failure, length
//!   divergence, or internal invariant violation
//! - **Anonymisation / Dedup**: `AnonymizationError`, `DedupError` - stage
//!   failures with no fallback; they abort the file
//! - **Infrastructure**: `IoError`, `ResourceExhausted`
//! - **Lifecycle**: `Cancelled`, `InternalError`
//!
//! ## Error Handling Strategy
//!
//! Errors are values: every stage returns `Result<StageStats, PktMaskError>`
//! and the executor records the error on the per-file result instead of
//! unwinding. `is_recoverable()` marks the kinds that a retry may fix;
//! `category()` feeds progress events and summary reporting.

use thiserror::Error;

/// Domain-specific errors for the capture sanitisation pipeline.
///
/// Each variant carries a descriptive message; the variant itself carries
/// the routing decision (which fallback, if any, applies).
#[derive(Error, Debug, Clone)]
pub enum PktMaskError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Input error: {0}")]
    InputError(String),

    #[error("Codec error: {0}")]
    CodecError(String),

    #[error("Marker unavailable: {0}")]
    MarkerUnavailable(String),

    #[error("Marker error: {0}")]
    MarkerError(String),

    #[error("Keep-rule validation failed: {0}")]
    RuleValidation(String),

    #[error("Masking error: {0}")]
    MaskingError(String),

    #[error("Anonymization error: {0}")]
    AnonymizationError(String),

    #[error("Deduplication error: {0}")]
    DedupError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl PktMaskError {
    /// Creates a new configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Creates a new input error
    pub fn input_error(msg: impl Into<String>) -> Self {
        Self::InputError(msg.into())
    }

    /// Creates a new codec error
    pub fn codec_error(msg: impl Into<String>) -> Self {
        Self::CodecError(msg.into())
    }

    /// Creates a new marker error
    pub fn marker_error(msg: impl Into<String>) -> Self {
        Self::MarkerError(msg.into())
    }

    /// Creates a new masking error
    pub fn masking_error(msg: impl Into<String>) -> Self {
        Self::MaskingError(msg.into())
    }

    /// Creates a new IO error
    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::IoError(msg.into())
    }

    /// Creates a new internal error
    pub fn internal_error(msg: impl Into<String>) -> Self {
        Self::InternalError(msg.into())
    }

    /// Creates a new cancellation marker
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Checks if the error indicates a retry-able condition
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PktMaskError::Timeout(_) | PktMaskError::ResourceExhausted(_) | PktMaskError::MarkerError(_)
        )
    }

    /// Checks if the error should trigger the masker's stage-level fallback
    ///
    /// Marker unavailability, marker crashes, and marker timeouts degrade
    /// the masking stage to its configured fallback; everything else aborts
    /// the file.
    pub fn triggers_masking_fallback(&self) -> bool {
        matches!(
            self,
            PktMaskError::MarkerUnavailable(_) | PktMaskError::MarkerError(_) | PktMaskError::Timeout(_)
        )
    }

    /// Gets the error category for reporting
    pub fn category(&self) -> &'static str {
        match self {
            PktMaskError::InvalidConfiguration(_) => "configuration",
            PktMaskError::InputError(_) => "input",
            PktMaskError::CodecError(_) => "codec",
            PktMaskError::MarkerUnavailable(_) => "marker",
            PktMaskError::MarkerError(_) => "marker",
            PktMaskError::RuleValidation(_) => "rule-validation",
            PktMaskError::MaskingError(_) => "masking",
            PktMaskError::AnonymizationError(_) => "anonymization",
            PktMaskError::DedupError(_) => "dedup",
            PktMaskError::IoError(_) => "io",
            PktMaskError::ResourceExhausted(_) => "resource",
            PktMaskError::Timeout(_) => "timeout",
            PktMaskError::Cancelled(_) => "cancellation",
            PktMaskError::InternalError(_) => "internal",
        }
    }
}

// Implement conversion from standard library errors
impl From<std::io::Error> for PktMaskError {
    fn from(err: std::io::Error) -> Self {
        PktMaskError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for PktMaskError {
    fn from(err: serde_json::Error) -> Self {
        PktMaskError::MarkerError(format!("unparseable tool output: {}", err))
    }
}
