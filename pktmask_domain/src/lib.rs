// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # PktMask Domain Layer
//!
//! Pure business logic for the PktMask capture sanitiser: the vocabulary the
//! rest of the system speaks. This crate owns the value objects of the
//! sanitisation domain (flow keys, sequence lifts, keep rules, pseudonym
//! maps), the per-file stage contract, the TLS preservation policy, and the
//! standardised statistics and progress events every stage reports.
//!
//! ## Architecture
//!
//! Following Domain-Driven Design and Clean Architecture principles:
//!
//! - **No I/O**: nothing in this crate opens a file, spawns a process, or
//!   touches a socket. Captures are infrastructure; byte ranges are domain.
//! - **No async**: the stage contract is synchronous. The infrastructure
//!   layer decides where the blocking work runs.
//! - **Dependency direction**: `pktmask` (application + infrastructure)
//!   depends on this crate, never the other way around.
//!
//! ## Module Structure
//!
//! - [`error`] - The `PktMaskError` hierarchy shared by all layers
//! - [`entities`] - `StageStats`, `ProcessResult`, `MaskingSummary`
//! - [`events`] - Progress events surfaced to host applications
//! - [`value_objects`] - Flow keys, sequence lift, keep rules, IP map
//! - [`services`] - Stage contract and the TLS preservation policy table

pub mod entities;
pub mod error;
pub mod events;
pub mod services;
pub mod value_objects;

// Re-export commonly used types at the crate root
pub use entities::{MaskingSummary, ProcessResult, StageStats};
pub use error::PktMaskError;
pub use events::{ProgressEvent, ProgressSink};
pub use services::stage_service::{StageContext, StageService};
pub use services::tls_policy::{TlsContentType, TlsPolicy, TlsRecordHeader};
pub use value_objects::flow_key::{FlowKey, TwoWayFlowKey};
pub use value_objects::ip_map::{AnonymizationMethod, IpMap, IpMapBuilder};
pub use value_objects::keep_rule::{KeepRule, KeepRuleSet, MergeClass, RuleKind};
pub use value_objects::seq_state::SeqState;
