// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # TCP Flow Identifiers
//!
//! A [`FlowKey`] identifies one *direction* of a TCP conversation: keep
//! rules, sequence state, and masking decisions are all direction-sensitive.
//! A [`TwoWayFlowKey`] canonicalises the two directions of the same
//! conversation onto a single value, for direction-insensitive membership
//! questions ("does the rule set know this flow at all?").

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Identifier for one TCP half-flow (direction-sensitive five-tuple).
///
/// The protocol is implicitly TCP; only TCP traffic is masked.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct FlowKey {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn new(src_ip: IpAddr, src_port: u16, dst_ip: IpAddr, dst_port: u16) -> Self {
        Self {
            src_ip,
            src_port,
            dst_ip,
            dst_port,
        }
    }

    /// The same conversation, seen from the other direction.
    pub fn reversed(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            src_port: self.dst_port,
            dst_ip: self.src_ip,
            dst_port: self.src_port,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

/// Identifier for a two-way TCP flow.
///
/// Both directions of a conversation map onto the same value: the endpoint
/// pair is ordered so that the smaller `(ip, port)` pair always comes first.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct TwoWayFlowKey(FlowKey);

impl From<FlowKey> for TwoWayFlowKey {
    fn from(other: FlowKey) -> Self {
        let p0 = (other.src_ip, other.src_port);
        let p1 = (other.dst_ip, other.dst_port);
        let ((src_ip, src_port), (dst_ip, dst_port)) = if p0 <= p1 { (p0, p1) } else { (p1, p0) };
        Self(FlowKey {
            src_ip,
            src_port,
            dst_ip,
            dst_port,
        })
    }
}

impl TwoWayFlowKey {
    /// The canonical directional key this two-way key is stored under.
    pub fn canonical(&self) -> &FlowKey {
        &self.0
    }
}
