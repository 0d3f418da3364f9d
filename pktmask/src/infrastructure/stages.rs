// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Pipeline Stages
//!
//! The three built-in stages, each implementing the domain
//! [`StageService`](pktmask_domain::StageService) contract:
//!
//! - [`dedup`] - content-addressed duplicate removal
//! - [`anonymize`] - IP pseudonymisation with checksum repair
//! - [`mask`] - keep-rule payload masking
//!
//! Disabled stages are not represented here; the executor degrades them to
//! a hard link so downstream stages always see a valid capture.

pub mod anonymize;
pub mod dedup;
pub mod mask;

pub use anonymize::AnonymizeStage;
pub use dedup::DedupStage;
pub use mask::MaskStage;
