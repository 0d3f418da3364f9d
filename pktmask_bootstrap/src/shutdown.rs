// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Shutdown Control
//!
//! Stop-request propagation shaped around how this pipeline actually ends:
//! stages are synchronous packet loops on the blocking pool, so the stop
//! signal is a plain `Arc<AtomicBool>` a stage polls between packets, and
//! "graceful" means the file in flight winds down (finishing the packet it
//! is on, publishing nothing) while no further files start.
//!
//! The [`ShutdownController`] therefore tracks two things:
//!
//! - the **stop flag**, set once by a signal (or the host) and handed to
//!   every `StageContext` via [`ShutdownController::stage_flag`];
//! - the **in-flight work count**, maintained by RAII [`WorkGuard`]s the
//!   run loop holds while files are being processed, so
//!   [`ShutdownController::drain`] can distinguish "wound down" from
//!   "stuck" (a wedged external parser, a dead NFS mount) and the binary
//!   can stop waiting after the grace period.
//!
//! There is no poisoning and no second-phase handshake: a stage that saw
//! the flag returns `Cancelled`, the executor discards its scratch
//! directory, and dropping the guard is the acknowledgement.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Default grace period for the in-flight file to wind down (in seconds)
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 5;

/// How often `drain` re-checks the work count. Polling keeps the guard
/// drop path free of wakeup bookkeeping (and of its lost-wakeup races).
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Shutdown controller: one stop flag, one in-flight work count.
///
/// Clone-able; every clone observes the same state.
#[derive(Clone, Default)]
pub struct ShutdownController {
    /// The flag stages poll between packets.
    stop: Arc<AtomicBool>,
    /// Wakes async waiters when the stop is requested.
    stop_notify: Arc<Notify>,
    /// Files (or other units of work) currently in flight.
    active: Arc<AtomicUsize>,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self::default()
    }

    /// The raw stop flag, for `StageContext::with_cancel` and anything
    /// else that polls synchronously between packets.
    pub fn stage_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Requests a stop: the flag flips, async waiters wake. Idempotent.
    pub fn request_stop(&self) {
        if !self.stop.swap(true, Ordering::SeqCst) {
            tracing::info!("stop requested; finishing the file in flight, starting no more");
            self.stop_notify.notify_waiters();
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Waits until a stop is requested.
    pub async fn stopped(&self) {
        if self.is_stopping() {
            return;
        }
        self.stop_notify.notified().await;
    }

    /// Registers a unit of in-flight work. Dropping the guard is the
    /// acknowledgement `drain` waits for.
    pub fn work_guard(&self) -> WorkGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        WorkGuard {
            active: self.active.clone(),
        }
    }

    /// True when no work is registered.
    pub fn is_idle(&self) -> bool {
        self.active.load(Ordering::SeqCst) == 0
    }

    /// Waits up to `grace` for all registered work to drop its guards.
    ///
    /// Returns `true` when the pipeline wound down in time, `false` when
    /// something is still holding a guard after the grace period - the
    /// caller decides whether that means a hard exit.
    pub async fn drain(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        while !self.is_idle() {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    "{} unit(s) of work still in flight after {:?} grace",
                    self.active.load(Ordering::SeqCst),
                    grace
                );
                return false;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
        true
    }
}

/// RAII registration of one unit of in-flight work.
///
/// Held by the run loop around each file; dropped on completion, success
/// or not, which is what lets [`ShutdownController::drain`] observe the
/// wind-down.
pub struct WorkGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}
