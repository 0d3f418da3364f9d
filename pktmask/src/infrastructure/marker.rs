// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Payload Marker
//!
//! The analysis half of payload masking: external deep-parser integration
//! and the protocol analysers that turn its claims into validated keep
//! rules.
//!
//! - [`tshark`] - subprocess detection, invocation, timeout, lenient parse
//! - [`tls_marker`] - the TLS analyser and the protocol registry

pub mod tls_marker;
pub mod tshark;

pub use tls_marker::{MarkerOutput, MarkerRegistry, ProtocolMarker, TlsMarker};
pub use tshark::{detect_tshark, TsharkRunner, TsharkScan};
