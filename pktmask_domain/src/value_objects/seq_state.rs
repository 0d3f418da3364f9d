// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Sequence-Number Lift
//!
//! TCP sequence numbers are 32-bit and wrap. Keep rules live in a 64-bit
//! *logical* sequence space so that a long-lived flow can be described by a
//! single monotone coordinate: `logical = (epoch << 32) | raw`, where
//! `epoch` counts observed wraps.
//!
//! The lift is per flow direction and fed with raw sequence numbers in
//! capture order. Both halves of the masking stage (the marker that builds
//! rules and the masker that applies them) drive an identical `SeqState`
//! over the same segment stream, so the two sides agree on every logical
//! coordinate without any shared state.
//!
//! ## Wrap semantics
//!
//! A sample within half the sequence space *ahead* of the last accepted
//! sample advances the state; if its raw value is numerically smaller, the
//! flow wrapped and the epoch increments. A sample logically *behind* the
//! current position (retransmission, reordering) never modifies the state;
//! if its raw value is numerically larger than the current position it
//! belongs to the previous epoch and is lifted there, so a segment
//! retransmitted across a wrap boundary keeps the logical coordinate it was
//! originally assigned and cannot bump the epoch twice.

/// Half of the 32-bit sequence space; the forward/backward decision point.
const HALF_WINDOW: u32 = 0x8000_0000;

/// Per-direction 32-bit to 64-bit sequence-number lift.
#[derive(Debug, Clone, Default)]
pub struct SeqState {
    last_seen: Option<u32>,
    epoch: u32,
}

impl SeqState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lifts a raw 32-bit sequence number into the 64-bit logical space,
    /// updating wrap-tracking state.
    ///
    /// Must be called with samples in capture order for one flow direction.
    pub fn lift(&mut self, seq: u32) -> u64 {
        let epoch_used = match self.last_seen {
            None => {
                self.last_seen = Some(seq);
                self.epoch
            }
            Some(last) => {
                let forward = seq.wrapping_sub(last);
                if forward < HALF_WINDOW {
                    // Advance (possibly zero). A numerically smaller value
                    // moving forward means the counter wrapped.
                    if seq < last {
                        self.epoch += 1;
                    }
                    self.last_seen = Some(seq);
                    self.epoch
                } else if seq > last {
                    // Behind the current position but numerically larger:
                    // data from before the most recent wrap.
                    self.epoch.saturating_sub(1)
                } else {
                    // Plain retransmission / reordering within the epoch.
                    self.epoch
                }
            }
        };
        (u64::from(epoch_used) << 32) | u64::from(seq)
    }

    /// Number of wraps observed so far.
    pub fn epoch(&self) -> u32 {
        self.epoch
    }
}
