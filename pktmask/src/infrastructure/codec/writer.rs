// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Capture Writer
//!
//! PCAP output with the reader's link type and timestamp resolution carried
//! over. Output is always classic PCAP: when the input was PCAPNG the stage
//! flags the conversion in its statistics, and the nanosecond-resolution
//! PCAP variant is chosen so PCAPNG timestamps lose nothing.

use pcap_file::pcap::{PcapHeader, PcapPacket, PcapWriter};
use pcap_file::{DataLink, Endianness, TsResolution};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use pktmask_domain::PktMaskError;

use super::reader::CapturePacket;

/// Snap length advertised in the output header; comfortably above any
/// frame the reader will hand us.
const SNAPLEN: u32 = 262_144;

/// Streaming PCAP writer.
pub struct CaptureWriter {
    inner: PcapWriter<BufWriter<File>>,
    packets_written: u64,
}

impl CaptureWriter {
    /// Creates the output file and writes the global header.
    pub fn create(
        path: &Path,
        link_type: DataLink,
        ts_resolution: TsResolution,
    ) -> Result<Self, PktMaskError> {
        let file = File::create(path)
            .map_err(|e| PktMaskError::io_error(format!("{}: {}", path.display(), e)))?;
        let header = PcapHeader {
            version_major: 2,
            version_minor: 4,
            ts_correction: 0,
            ts_accuracy: 0,
            snaplen: SNAPLEN,
            datalink: link_type,
            ts_resolution,
            endianness: Endianness::native(),
        };
        let inner = PcapWriter::with_header(BufWriter::new(file), header)
            .map_err(|e| PktMaskError::codec_error(format!("{}: {}", path.display(), e)))?;
        Ok(Self {
            inner,
            packets_written: 0,
        })
    }

    /// Appends one packet, preserving timestamp and original length.
    pub fn write_packet(&mut self, packet: &CapturePacket) -> Result<(), PktMaskError> {
        let record = PcapPacket::new(packet.timestamp, packet.orig_len, &packet.data);
        self.inner
            .write_packet(&record)
            .map_err(|e| PktMaskError::io_error(e.to_string()))?;
        self.packets_written += 1;
        Ok(())
    }

    pub fn packets_written(&self) -> u64 {
        self.packets_written
    }

    /// Lazily creates the writer in `slot`. Stages defer creation to the
    /// first packet so the reader has seen the PCAPNG interface description
    /// (and thus the real link type) by then.
    pub fn ensure<'a>(
        slot: &'a mut Option<CaptureWriter>,
        path: &Path,
        link_type: DataLink,
        ts_resolution: TsResolution,
    ) -> Result<&'a mut CaptureWriter, PktMaskError> {
        if slot.is_none() {
            *slot = Some(CaptureWriter::create(path, link_type, ts_resolution)?);
        }
        Ok(slot.as_mut().expect("writer just created"))
    }

    /// Flushes buffered output and closes the file.
    pub fn finish(self) -> Result<(), PktMaskError> {
        let mut file = self.inner.into_writer();
        file.flush().map_err(|e| PktMaskError::io_error(e.to_string()))?;
        Ok(())
    }
}
