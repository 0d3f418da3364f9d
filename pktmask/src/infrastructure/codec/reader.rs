// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Capture Reader
//!
//! Streaming access to PCAP and PCAPNG files. The format is sniffed from
//! the magic bytes, packets are yielded one at a time with their original
//! timestamps, and nothing is held beyond the packet in flight - captures
//! of hundreds of millions of packets stream in constant memory.
//!
//! PCAPNG support covers what sanitisation needs: enhanced packet blocks
//! (and legacy simple packet blocks), with interface description blocks
//! consulted for the link type. Every other block type is counted and
//! skipped. A truncated final packet - the classic killed-capture artifact -
//! ends the stream with a counted diagnostic instead of failing the file;
//! any other decode failure is a codec error and fails the file.

use pcap_file::pcap::PcapReader;
use pcap_file::pcapng::{Block, PcapNgReader};
use pcap_file::{DataLink, PcapError, TsResolution};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::Duration;

use pktmask_domain::PktMaskError;

/// One packet pulled from a capture.
#[derive(Debug, Clone)]
pub struct CapturePacket {
    /// Wire-clock timestamp (duration since the Unix epoch).
    pub timestamp: Duration,
    /// Original on-wire length; `data` may be shorter when the capture was
    /// taken with a snap length.
    pub orig_len: u32,
    /// Captured link-layer bytes.
    pub data: Vec<u8>,
}

/// Container format of the input file.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CaptureFormat {
    Pcap,
    PcapNg,
}

enum Inner {
    Pcap(PcapReader<BufReader<File>>),
    PcapNg(Box<PcapNgReader<BufReader<File>>>),
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Inner::Pcap(_) => f.write_str("Inner::Pcap(..)"),
            Inner::PcapNg(_) => f.write_str("Inner::PcapNg(..)"),
        }
    }
}

/// Streaming capture reader.
#[derive(Debug)]
pub struct CaptureReader {
    inner: Inner,
    format: CaptureFormat,
    link_type: DataLink,
    ts_resolution: TsResolution,
    skipped_blocks: u64,
    trailing_truncation: bool,
}

const PCAPNG_MAGIC: [u8; 4] = [0x0a, 0x0d, 0x0d, 0x0a];
const PCAP_MAGICS: [[u8; 4]; 4] = [
    [0xa1, 0xb2, 0xc3, 0xd4], // big endian, microseconds
    [0xd4, 0xc3, 0xb2, 0xa1], // little endian, microseconds
    [0xa1, 0xb2, 0x3c, 0x4d], // big endian, nanoseconds
    [0x4d, 0x3c, 0xb2, 0xa1], // little endian, nanoseconds
];

impl CaptureReader {
    /// Opens a capture, sniffing PCAP vs PCAPNG from the magic bytes.
    pub fn open(path: &Path) -> Result<Self, PktMaskError> {
        let mut probe = File::open(path)
            .map_err(|e| PktMaskError::input_error(format!("{}: {}", path.display(), e)))?;
        let mut magic = [0u8; 4];
        probe
            .read_exact(&mut magic)
            .map_err(|e| PktMaskError::input_error(format!("{}: {}", path.display(), e)))?;
        drop(probe);

        let file = BufReader::new(File::open(path)?);
        if magic == PCAPNG_MAGIC {
            let reader = PcapNgReader::new(file)
                .map_err(|e| PktMaskError::codec_error(format!("{}: {}", path.display(), e)))?;
            Ok(Self {
                inner: Inner::PcapNg(Box::new(reader)),
                format: CaptureFormat::PcapNg,
                // Until an interface description block says otherwise.
                link_type: DataLink::ETHERNET,
                ts_resolution: TsResolution::NanoSecond,
                skipped_blocks: 0,
                trailing_truncation: false,
            })
        } else if PCAP_MAGICS.contains(&magic) {
            let reader = PcapReader::new(file)
                .map_err(|e| PktMaskError::codec_error(format!("{}: {}", path.display(), e)))?;
            let header = reader.header();
            Ok(Self {
                inner: Inner::Pcap(reader),
                format: CaptureFormat::Pcap,
                link_type: header.datalink,
                ts_resolution: header.ts_resolution,
                skipped_blocks: 0,
                trailing_truncation: false,
            })
        } else {
            Err(PktMaskError::codec_error(format!(
                "{}: not a PCAP or PCAPNG capture (magic {:02x}{:02x}{:02x}{:02x})",
                path.display(),
                magic[0],
                magic[1],
                magic[2],
                magic[3]
            )))
        }
    }

    pub fn format(&self) -> CaptureFormat {
        self.format
    }

    /// Link type of the capture. For PCAPNG this is taken from the first
    /// interface description block, which precedes any packet block.
    pub fn link_type(&self) -> DataLink {
        self.link_type
    }

    pub fn ts_resolution(&self) -> TsResolution {
        self.ts_resolution
    }

    /// PCAPNG blocks skipped because they carry no packet data.
    pub fn skipped_blocks(&self) -> u64 {
        self.skipped_blocks
    }

    /// True when the stream ended on a truncated trailing packet.
    pub fn trailing_truncation(&self) -> bool {
        self.trailing_truncation
    }

    /// Yields the next packet, `None` at end of stream.
    pub fn next_packet(&mut self) -> Option<Result<CapturePacket, PktMaskError>> {
        match &mut self.inner {
            Inner::Pcap(reader) => match reader.next_packet()? {
                Ok(pkt) => Some(Ok(CapturePacket {
                    timestamp: pkt.timestamp,
                    orig_len: pkt.orig_len,
                    data: pkt.data.into_owned(),
                })),
                Err(PcapError::IncompleteBuffer) => {
                    self.trailing_truncation = true;
                    None
                }
                Err(e) => Some(Err(PktMaskError::codec_error(e.to_string()))),
            },
            Inner::PcapNg(reader) => loop {
                let block = match reader.next_block() {
                    Some(Ok(block)) => block,
                    Some(Err(PcapError::IncompleteBuffer)) => {
                        self.trailing_truncation = true;
                        return None;
                    }
                    Some(Err(e)) => return Some(Err(PktMaskError::codec_error(e.to_string()))),
                    None => return None,
                };
                match block {
                    Block::InterfaceDescription(idb) => {
                        self.link_type = idb.linktype;
                        self.skipped_blocks += 1;
                    }
                    Block::EnhancedPacket(epb) => {
                        return Some(Ok(CapturePacket {
                            timestamp: epb.timestamp,
                            orig_len: epb.original_len,
                            data: epb.data.into_owned(),
                        }));
                    }
                    Block::SimplePacket(spb) => {
                        let data = spb.data.into_owned();
                        return Some(Ok(CapturePacket {
                            timestamp: Duration::ZERO,
                            orig_len: spb.original_len,
                            data,
                        }));
                    }
                    _ => {
                        self.skipped_blocks += 1;
                    }
                }
            },
        }
    }
}
