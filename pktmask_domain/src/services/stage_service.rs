// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Stage Service Trait
//!
//! The unified contract every pipeline stage implements, whether built-in
//! (deduplication, anonymisation, masking) or a pass-through standing in
//! for a disabled stage.
//!
//! ## The contract
//!
//! A stage transforms one capture file into another:
//!
//! - **Input**: a readable capture at `input`; **output**: a capture the
//!   stage writes to `output`. Stage *i* reads what stage *i−1* wrote.
//! - **Order**: packet order is preserved. A stage may drop packets
//!   (deduplication) but never reorders them.
//! - **Validity**: the output must be a capture any later stage accepts,
//!   even when the stage changed nothing.
//! - **Cancellation**: observed between packets via the [`StageContext`];
//!   a cancelled stage returns `PktMaskError::Cancelled` promptly and may
//!   leave a partial `output` behind - the executor owns the scratch
//!   directory and discards it.
//! - **Errors**: returned as values. The executor aborts the file, records
//!   the error, and continues with the next file.
//!
//! ## Why a file-level contract?
//!
//! Stages differ wildly in the state they need (a digest set, a shared
//! pseudonym map, a rule set produced by an external tool). A per-packet
//! contract would force that state into a shared context type touched by
//! every stage. The file-level contract keeps each stage's state private
//! and makes the composition rule trivial: chain files through a scratch
//! directory.

use crate::entities::stage_stats::StageStats;
use crate::error::PktMaskError;
use crate::value_objects::ip_map::IpMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared per-file state handed to every stage invocation.
///
/// Carries only cross-stage concerns: the cancellation flag and the
/// directory-scoped pseudonym map. Stage-private state lives in the stage.
#[derive(Clone)]
pub struct StageContext {
    cancel: Arc<AtomicBool>,
    ip_map: Option<Arc<IpMap>>,
}

impl StageContext {
    /// A context that is never cancelled and carries no pseudonym map.
    pub fn new() -> Self {
        Self {
            cancel: Arc::new(AtomicBool::new(false)),
            ip_map: None,
        }
    }

    /// A context observing an external cancellation flag.
    pub fn with_cancel(cancel: Arc<AtomicBool>) -> Self {
        Self { cancel, ip_map: None }
    }

    pub fn set_ip_map(&mut self, map: Arc<IpMap>) {
        self.ip_map = Some(map);
    }

    pub fn ip_map(&self) -> Option<&Arc<IpMap>> {
        self.ip_map.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Returns `Err(Cancelled)` once the flag is set. Stages call this
    /// between packets.
    pub fn check_cancelled(&self) -> Result<(), PktMaskError> {
        if self.is_cancelled() {
            Err(PktMaskError::cancelled("stage interrupted"))
        } else {
            Ok(())
        }
    }
}

impl Default for StageContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Unified trait all pipeline stages implement.
///
/// Implementations must be `Send + Sync`: the executor may run distinct
/// files on distinct worker threads, sharing one stage instance.
pub trait StageService: Send + Sync {
    /// Stable stage name used in statistics, events and scratch file names.
    fn name(&self) -> &'static str;

    /// Transforms the capture at `input` into the capture at `output`.
    ///
    /// # Errors
    ///
    /// Any error aborts the file; `Cancelled` is reported but not counted
    /// as a stage failure by the controller.
    fn process_capture(
        &self,
        input: &Path,
        output: &Path,
        ctx: &mut StageContext,
    ) -> Result<StageStats, PktMaskError>;
}
