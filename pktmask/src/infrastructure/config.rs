// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Configuration
//!
//! The canonical configuration document, loaded once and validated loudly
//! before any stage runs. Layering follows the usual precedence: built-in
//! defaults, then an optional TOML file, then `PKTMASK__`-prefixed
//! environment variables (`PKTMASK__MASK_PAYLOADS__MASKER__BATCH_SIZE=500`).
//!
//! ## Example
//!
//! ```toml
//! [remove_dupes]
//! enabled = true
//!
//! [anonymize_ips]
//! enabled = true
//! method = "prefix_preserving"
//! ipv4_prefix = 24
//! ipv6_prefix = 64
//!
//! [mask_payloads]
//! enabled = true
//! protocol = "tls"
//!
//! [mask_payloads.marker]
//! timeout_seconds = 300
//!
//! [mask_payloads.marker.tls]
//! preserve_handshake = true
//! preserve_alert = true
//! preserve_change_cipher_spec = true
//! preserve_application_data = false
//!
//! [mask_payloads.masker]
//! batch_size = 1000
//! memory_limit_mb = 2048
//!
//! [mask_payloads.error_recovery]
//! fallback_mode = "copy_original"
//! max_retries = 3
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use pktmask_domain::services::tls_policy::TlsPolicy;
use pktmask_domain::{AnonymizationMethod, PktMaskError};

/// Masking fallback policy. One configured value covers both scopes: the
/// stage level honours `copy_original`/`abort`, the packet level honours
/// `skip_packet`/`full_mask`/`abort` (with `copy_original` degrading to
/// `skip_packet` per packet).
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    SkipPacket,
    FullMask,
    #[default]
    CopyOriginal,
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub enabled: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnonymizeConfig {
    pub enabled: bool,
    pub method: AnonymizationMethod,
    pub ipv4_prefix: u8,
    pub ipv6_prefix: u8,
}

impl Default for AnonymizeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            method: AnonymizationMethod::PrefixPreserving,
            ipv4_prefix: 24,
            ipv6_prefix: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsMarkerConfig {
    pub preserve_handshake: bool,
    pub preserve_alert: bool,
    pub preserve_change_cipher_spec: bool,
    pub preserve_application_data: bool,
}

impl Default for TlsMarkerConfig {
    fn default() -> Self {
        Self {
            preserve_handshake: true,
            preserve_alert: true,
            preserve_change_cipher_spec: true,
            preserve_application_data: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    pub timeout_seconds: u64,
    pub tls: TlsMarkerConfig,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 300,
            tls: TlsMarkerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskerConfig {
    pub batch_size: usize,
    pub memory_limit_mb: u64,
}

impl Default for MaskerConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            memory_limit_mb: 2048,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorRecoveryConfig {
    pub fallback_mode: FallbackMode,
    pub max_retries: u32,
}

impl Default for ErrorRecoveryConfig {
    fn default() -> Self {
        Self {
            fallback_mode: FallbackMode::CopyOriginal,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskConfig {
    pub enabled: bool,
    pub protocol: String,
    pub marker: MarkerConfig,
    pub masker: MaskerConfig,
    pub error_recovery: ErrorRecoveryConfig,
}

impl Default for MaskConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            protocol: "tls".to_string(),
            marker: MarkerConfig::default(),
            masker: MaskerConfig::default(),
            error_recovery: ErrorRecoveryConfig::default(),
        }
    }
}

/// The full configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PktMaskConfig {
    pub remove_dupes: DedupConfig,
    pub anonymize_ips: AnonymizeConfig,
    pub mask_payloads: MaskConfig,
}

impl PktMaskConfig {
    /// Loads configuration from defaults, an optional file, and the
    /// environment, then validates it.
    pub fn load(path: Option<&Path>) -> Result<Self, PktMaskError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("PKTMASK")
                .separator("__")
                .try_parsing(true),
        );
        let raw = builder
            .build()
            .map_err(|e| PktMaskError::invalid_config(e.to_string()))?;
        let parsed: Self = raw
            .try_deserialize()
            .map_err(|e| PktMaskError::invalid_config(e.to_string()))?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Validates every option; the first violation is a loud error before
    /// any stage runs.
    pub fn validate(&self) -> Result<(), PktMaskError> {
        let a = &self.anonymize_ips;
        if !(8..=30).contains(&a.ipv4_prefix) {
            return Err(PktMaskError::invalid_config(format!(
                "anonymize_ips.ipv4_prefix {} out of range (8-30)",
                a.ipv4_prefix
            )));
        }
        if !(16..=120).contains(&a.ipv6_prefix) {
            return Err(PktMaskError::invalid_config(format!(
                "anonymize_ips.ipv6_prefix {} out of range (16-120)",
                a.ipv6_prefix
            )));
        }
        let m = &self.mask_payloads;
        if m.masker.batch_size == 0 {
            return Err(PktMaskError::invalid_config(
                "mask_payloads.masker.batch_size must be at least 1",
            ));
        }
        if m.masker.memory_limit_mb < 64 {
            return Err(PktMaskError::invalid_config(format!(
                "mask_payloads.masker.memory_limit_mb {} below minimum 64",
                m.masker.memory_limit_mb
            )));
        }
        if m.marker.timeout_seconds == 0 {
            return Err(PktMaskError::invalid_config(
                "mask_payloads.marker.timeout_seconds must be at least 1",
            ));
        }
        // Protocol names resolve against the compiled-in registry at
        // wiring time; here we only reject the obviously empty.
        if m.protocol.trim().is_empty() {
            return Err(PktMaskError::invalid_config(
                "mask_payloads.protocol must not be empty",
            ));
        }
        Ok(())
    }

    /// Applies CLI stage toggles on top of the loaded document.
    pub fn apply_toggles(&mut self, no_dedup: bool, no_anon: bool, no_mask: bool) {
        if no_dedup {
            self.remove_dupes.enabled = false;
        }
        if no_anon {
            self.anonymize_ips.enabled = false;
        }
        if no_mask {
            self.mask_payloads.enabled = false;
        }
    }

    /// The TLS preservation policy this configuration selects.
    pub fn tls_policy(&self) -> TlsPolicy {
        let tls = &self.mask_payloads.marker.tls;
        TlsPolicy {
            preserve_handshake: tls.preserve_handshake,
            preserve_alert: tls.preserve_alert,
            preserve_change_cipher_spec: tls.preserve_change_cipher_spec,
            preserve_application_data: tls.preserve_application_data,
        }
    }

    pub fn marker_timeout(&self) -> Duration {
        Duration::from_secs(self.mask_payloads.marker.timeout_seconds)
    }
}
