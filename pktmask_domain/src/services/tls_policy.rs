// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # TLS Preservation Policy
//!
//! Table-driven decisions about what survives masking, keyed by TLS record
//! content type. Each content type resolves to two policy bits: keep the
//! 5-byte record header, keep the record body. The defaults preserve
//! handshake, alert and change-cipher-spec records whole, keep only the
//! header of application-data records, and keep unknown content types whole
//! as the fail-safe (masking something we do not understand could destroy
//! evidence that it was not TLS at all).
//!
//! Disabling a `preserve_*` flag degrades that record type to header-only:
//! the framing stays parseable in the sanitised trace while the content is
//! zeroed.
//!
//! This module also owns the 5-byte record-header parser and the validation
//! gates applied to every candidate rule: declared length bounds, the tight
//! bounds on change-cipher-spec and alert bodies, and the requirement that
//! the header byte match the type the external parser claimed.

use crate::error::PktMaskError;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Length of a TLS record header on the wire.
pub const TLS_RECORD_HEADER_LEN: usize = 5;

/// Maximum TLS record body length (RFC 8446 §5.1; fragments must not
/// exceed 2^14 bytes).
pub const TLS_MAX_RECORD_LEN: u16 = 16_384;

/// Maximum span a single keep rule may cover: one record body plus its
/// header.
pub const TLS_MAX_RULE_SPAN: u64 = TLS_MAX_RECORD_LEN as u64 + TLS_RECORD_HEADER_LEN as u64;

/// TLS record content types.
///
/// Mirrors the wire values; unknown bytes are carried, not rejected, so the
/// fail-safe policy can apply to them.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub enum TlsContentType {
    ChangeCipherSpec,
    Alert,
    Handshake,
    ApplicationData,
    Heartbeat,
    Unknown(u8),
}

impl TlsContentType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            20 => TlsContentType::ChangeCipherSpec,
            21 => TlsContentType::Alert,
            22 => TlsContentType::Handshake,
            23 => TlsContentType::ApplicationData,
            24 => TlsContentType::Heartbeat,
            other => TlsContentType::Unknown(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            TlsContentType::ChangeCipherSpec => 20,
            TlsContentType::Alert => 21,
            TlsContentType::Handshake => 22,
            TlsContentType::ApplicationData => 23,
            TlsContentType::Heartbeat => 24,
            TlsContentType::Unknown(v) => *v,
        }
    }

    /// True for the byte values that can plausibly start a record.
    pub fn is_known(&self) -> bool {
        !matches!(self, TlsContentType::Unknown(_))
    }
}

/// The two policy bits for one content type.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct RecordPolicy {
    pub keep_header: bool,
    pub keep_body: bool,
}

impl RecordPolicy {
    pub const WHOLE_RECORD: RecordPolicy = RecordPolicy {
        keep_header: true,
        keep_body: true,
    };
    pub const HEADER_ONLY: RecordPolicy = RecordPolicy {
        keep_header: true,
        keep_body: false,
    };
}

/// The preservation policy for one run of the marker.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct TlsPolicy {
    pub preserve_handshake: bool,
    pub preserve_alert: bool,
    pub preserve_change_cipher_spec: bool,
    pub preserve_application_data: bool,
}

impl Default for TlsPolicy {
    fn default() -> Self {
        Self {
            preserve_handshake: true,
            preserve_alert: true,
            preserve_change_cipher_spec: true,
            preserve_application_data: false,
        }
    }
}

/// The default policy, shared where no configuration is in play.
pub static DEFAULT_TLS_POLICY: Lazy<TlsPolicy> = Lazy::new(TlsPolicy::default);

impl TlsPolicy {
    /// Resolves the policy bits for a content type.
    pub fn policy_for(&self, content_type: TlsContentType) -> RecordPolicy {
        let keep_body = match content_type {
            TlsContentType::Handshake => self.preserve_handshake,
            TlsContentType::Alert => self.preserve_alert,
            TlsContentType::ChangeCipherSpec => self.preserve_change_cipher_spec,
            TlsContentType::ApplicationData => self.preserve_application_data,
            // Fail-safe: keep what we cannot classify.
            TlsContentType::Heartbeat | TlsContentType::Unknown(_) => true,
        };
        if keep_body {
            RecordPolicy::WHOLE_RECORD
        } else {
            RecordPolicy::HEADER_ONLY
        }
    }
}

/// A parsed 5-byte TLS record header.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct TlsRecordHeader {
    pub content_type: TlsContentType,
    /// Legacy record version, e.g. 0x0303.
    pub version: u16,
    /// Declared body length.
    pub length: u16,
}

impl TlsRecordHeader {
    /// Parses a record header from the front of `bytes`, or `None` when
    /// fewer than five bytes remain.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < TLS_RECORD_HEADER_LEN {
            return None;
        }
        Some(Self {
            content_type: TlsContentType::from_u8(bytes[0]),
            version: u16::from_be_bytes([bytes[1], bytes[2]]),
            length: u16::from_be_bytes([bytes[3], bytes[4]]),
        })
    }

    /// True when the header looks like a genuine in-band record start:
    /// known content type, an SSL3/TLS version word, and a length within
    /// the protocol maximum.
    pub fn is_plausible(&self) -> bool {
        self.content_type.is_known()
            && (self.version & 0xff00) == 0x0300
            && (self.version & 0x00ff) <= 0x04
            && self.length <= TLS_MAX_RECORD_LEN
    }

    /// Applies the validation gates to a candidate record claimed to be of
    /// `claimed` type by the external parser.
    ///
    /// # Errors
    ///
    /// `RuleValidation` when the declared length exceeds the TLS maximum,
    /// when a change-cipher-spec or alert body exceeds its tight bound, or
    /// when the header byte contradicts the claim. The caller discards the
    /// candidate and logs the diagnostic.
    pub fn validate_claim(&self, claimed: TlsContentType) -> Result<(), PktMaskError> {
        if self.length > TLS_MAX_RECORD_LEN {
            return Err(PktMaskError::RuleValidation(format!(
                "declared record length {} exceeds TLS maximum {}",
                self.length, TLS_MAX_RECORD_LEN
            )));
        }
        let tight_bound = match self.content_type {
            TlsContentType::ChangeCipherSpec => Some(2u16),
            TlsContentType::Alert => Some(2u16),
            _ => None,
        };
        if let Some(bound) = tight_bound {
            if self.length > bound {
                return Err(PktMaskError::RuleValidation(format!(
                    "{:?} record declares {} body bytes, bound is {}",
                    self.content_type, self.length, bound
                )));
            }
        }
        if self.content_type != claimed {
            return Err(PktMaskError::RuleValidation(format!(
                "header content type {:?} does not match claimed {:?}",
                self.content_type, claimed
            )));
        }
        Ok(())
    }
}
