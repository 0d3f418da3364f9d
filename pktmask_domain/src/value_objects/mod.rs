// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Domain Value Objects
//!
//! Immutable values of the sanitisation domain. Each type validates its own
//! invariants on construction and is freely cloneable and hashable where
//! identity is structural.
//!
//! - [`flow_key`] - directional and canonical TCP flow identifiers
//! - [`seq_state`] - the 32-bit to 64-bit TCP sequence-number lift
//! - [`keep_rule`] - byte ranges that survive masking, and their sets
//! - [`ip_map`] - the directory-scoped IP pseudonym table

pub mod flow_key;
pub mod ip_map;
pub mod keep_rule;
pub mod seq_state;

pub use flow_key::{FlowKey, TwoWayFlowKey};
pub use ip_map::{AnonymizationMethod, IpMap, IpMapBuilder};
pub use keep_rule::{KeepRule, KeepRuleSet, MergeClass, RuleKind};
pub use seq_state::SeqState;
