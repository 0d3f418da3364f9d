// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # PktMask
//!
//! Offline batch sanitiser for packet captures. Each input file runs
//! through a three-stage pipeline - duplicate removal, IP
//! pseudonymisation, TLS payload masking - and comes out as a shareable
//! PCAP: same packets, same lengths, same framing, none of the content or
//! host identity.
//!
//! ## Architecture
//!
//! The workspace splits along the usual layered lines:
//!
//! - `pktmask-domain` - the vocabulary: flow keys, sequence lifts, keep
//!   rules, the pseudonym map, the stage contract, statistics and events
//! - this crate - the machinery: the capture codec, the three stages, the
//!   external-parser integration, the per-file executor and the directory
//!   controller
//! - `pktmask-bootstrap` - the edges: CLI, logging init, signals, exit
//!   codes
//!
//! ## Library use
//!
//! ```rust,no_run
//! use std::sync::atomic::AtomicBool;
//! use std::sync::Arc;
//! use pktmask::application::services::DirectoryProcessor;
//! use pktmask::infrastructure::config::PktMaskConfig;
//! use pktmask_domain::events::progress_event::null_sink;
//!
//! # async fn run() -> Result<(), pktmask_domain::PktMaskError> {
//! let config = PktMaskConfig::default();
//! let processor = DirectoryProcessor::new(config, null_sink(), Arc::new(AtomicBool::new(false)), 1)?;
//! let summary = processor
//!     .run("captures/".as_ref(), "sanitised/".as_ref())
//!     .await?;
//! println!("{} ok, {} failed", summary.succeeded, summary.failed);
//! # Ok(())
//! # }
//! ```

pub mod application;
pub mod infrastructure;

// The convenient front door for embedding hosts.
pub use application::services::{DirectoryProcessor, FilePipeline, PipelineStage, RunSummary};
pub use infrastructure::config::PktMaskConfig;
