// /////////////////////////////////////////////////////////////////////////////
// PktMask
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Layered Packet View
//!
//! Offset-based decapsulation over a raw frame: every address, header and
//! payload the stages touch is located by byte offset so rewrites happen in
//! place and lengths can never drift. The walk peels, in order, Ethernet,
//! VLAN/QinQ tags, MPLS label stacks, IPv4/IPv6 (with IPv6 extension
//! headers), GRE (including ERSPAN and NVGRE payloads), and the UDP
//! tunnels VXLAN and GENEVE, until it reaches the innermost transport.
//!
//! The walk is *total*: it never fails. Non-IP frames produce an empty
//! layer list; a malformed or unrecognised inner header stops the walk and
//! records why, keeping every layer found so far. Stages decide what that
//! means for them - the anonymiser rewrites the layers that were found and
//! counts the stop, the masker passes the packet through when no innermost
//! TCP emerged.
//!
//! Header parsing leans on `etherparse` slices anchored at the current
//! offset; tunnel headers etherparse does not model (GRE, VXLAN, GENEVE,
//! ERSPAN, MPLS) are parsed directly.

use etherparse::{Ethernet2HeaderSlice, Ipv4HeaderSlice, Ipv6HeaderSlice, SingleVlanHeaderSlice, TcpHeaderSlice, UdpHeaderSlice};
use std::net::IpAddr;

pub const ETH_P_IPV4: u16 = 0x0800;
pub const ETH_P_IPV6: u16 = 0x86dd;
pub const ETH_P_VLAN: u16 = 0x8100;
pub const ETH_P_QINQ: u16 = 0x88a8;
pub const ETH_P_QINQ_LEGACY: u16 = 0x9100;
pub const ETH_P_MPLS_UC: u16 = 0x8847;
pub const ETH_P_MPLS_MC: u16 = 0x8848;
/// Transparent Ethernet bridging (NVGRE / VXLAN inner frames).
pub const ETH_P_TEB: u16 = 0x6558;
pub const ETH_P_ERSPAN2: u16 = 0x88be;
pub const ETH_P_ERSPAN3: u16 = 0x22eb;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_IPIP: u8 = 4;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_IPV6: u8 = 41;
pub const IPPROTO_GRE: u8 = 47;
pub const IPPROTO_ICMPV6: u8 = 58;

pub const VXLAN_PORT: u16 = 4789;
pub const GENEVE_PORT: u16 = 6081;

/// Encapsulation depth bound; beyond this the walk stops.
const MAX_DEPTH: usize = 8;

/// Innermost-TCP description, all offsets frame-absolute.
#[derive(Clone, Debug)]
pub struct TcpLayer {
    pub offset: usize,
    pub header_len: usize,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub checksum_offset: usize,
    pub payload_offset: usize,
    pub payload_len: usize,
}

#[derive(Clone, Debug)]
pub struct UdpLayer {
    pub offset: usize,
    pub src_port: u16,
    pub dst_port: u16,
    pub checksum_offset: usize,
    pub payload_offset: usize,
    pub payload_len: usize,
    /// UDP checksum of zero means "not computed" over IPv4.
    pub has_checksum: bool,
}

#[derive(Clone, Debug)]
pub struct IcmpLayer {
    pub offset: usize,
    pub len: usize,
    pub is_v6: bool,
    pub checksum_offset: usize,
}

#[derive(Clone, Debug)]
pub struct GreLayer {
    pub offset: usize,
    pub header_len: usize,
    /// Offset of the optional checksum field, when the C bit is set.
    pub checksum_offset: Option<usize>,
    /// Bytes covered by the GRE checksum: header plus payload.
    pub span_len: usize,
}

/// The protocol immediately carried by one IP layer.
#[derive(Clone, Debug)]
pub enum L4 {
    Tcp(TcpLayer),
    Udp(UdpLayer),
    Icmp(IcmpLayer),
    Gre(GreLayer),
    /// IP-in-IP; the next entry in `ip_layers` is the payload.
    Encapsulated,
    Other(u8),
}

/// One IP header found during the walk, outermost first.
#[derive(Clone, Debug)]
pub struct IpLayer {
    pub offset: usize,
    pub is_v6: bool,
    pub header_len: usize,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_offset: usize,
    pub dst_offset: usize,
    /// Effective payload protocol (after the IPv6 extension walk).
    pub protocol: u8,
    pub payload_offset: usize,
    /// Payload length clamped to the captured bytes.
    pub payload_len: usize,
    /// True when the IP-declared length exceeds the captured bytes;
    /// checksum recomputation is skipped for truncated layers.
    pub truncated: bool,
    pub l4: L4,
}

/// Result of the decapsulation walk.
#[derive(Clone, Debug, Default)]
pub struct PacketLayers {
    /// IP layers, outermost first.
    pub ip_layers: Vec<IpLayer>,
    /// Tunnel encapsulations peeled, in order.
    pub tunnels: Vec<&'static str>,
    /// Why the walk stopped early, if it did.
    pub stopped: Option<String>,
}

impl PacketLayers {
    /// The innermost IP layer, if any.
    pub fn innermost_ip(&self) -> Option<&IpLayer> {
        self.ip_layers.last()
    }

    /// The innermost TCP segment together with its IP layer.
    pub fn innermost_tcp(&self) -> Option<(&IpLayer, &TcpLayer)> {
        match self.ip_layers.last() {
            Some(ip) => match &ip.l4 {
                L4::Tcp(tcp) => Some((ip, tcp)),
                _ => None,
            },
            None => None,
        }
    }
}

/// Link-layer framing the walk understands.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum LinkKind {
    Ethernet,
    /// Raw IP, version sniffed from the first nibble.
    Raw,
    Ipv4,
    Ipv6,
    /// BSD loopback: 4-byte family word before the IP header.
    Null,
}

impl LinkKind {
    /// Maps a pcap link-type number onto a supported framing.
    pub fn from_link_type(link_type: u32) -> Option<Self> {
        match link_type {
            0 | 108 => Some(LinkKind::Null),
            1 => Some(LinkKind::Ethernet),
            101 => Some(LinkKind::Raw),
            228 => Some(LinkKind::Ipv4),
            229 => Some(LinkKind::Ipv6),
            _ => None,
        }
    }
}

/// Walks the frame and returns every layer it can locate.
pub fn parse_packet(data: &[u8], link: LinkKind) -> PacketLayers {
    let mut layers = PacketLayers::default();
    let mut walker = Walker { data, layers: &mut layers };
    match link {
        LinkKind::Ethernet => walker.walk_ethernet(0, 0),
        LinkKind::Ipv4 => walker.walk_ip(0, false, 0),
        LinkKind::Ipv6 => walker.walk_ip(0, true, 0),
        LinkKind::Raw => walker.walk_raw_ip(0, 0),
        LinkKind::Null => {
            if data.len() < 4 {
                walker.stop("loopback frame shorter than family word");
            } else {
                walker.walk_raw_ip(4, 0);
            }
        }
    }
    layers
}

struct Walker<'a, 'b> {
    data: &'a [u8],
    layers: &'b mut PacketLayers,
}

impl Walker<'_, '_> {
    fn stop(&mut self, reason: impl Into<String>) {
        if self.layers.stopped.is_none() {
            self.layers.stopped = Some(reason.into());
        }
    }

    fn walk_raw_ip(&mut self, offset: usize, depth: usize) {
        match self.data.get(offset).map(|b| b >> 4) {
            Some(4) => self.walk_ip(offset, false, depth),
            Some(6) => self.walk_ip(offset, true, depth),
            _ => self.stop("raw frame with unrecognised IP version"),
        }
    }

    fn walk_ethernet(&mut self, offset: usize, depth: usize) {
        if depth > MAX_DEPTH {
            return self.stop("encapsulation deeper than supported");
        }
        let eth = match Ethernet2HeaderSlice::from_slice(&self.data[offset.min(self.data.len())..]) {
            Ok(eth) => eth,
            Err(e) => return self.stop(format!("ethernet header: {}", e)),
        };
        self.walk_ethertype(offset + 14, eth.ether_type().0, depth)
    }

    fn walk_ethertype(&mut self, mut offset: usize, mut ethertype: u16, depth: usize) {
        // Peel VLAN tags, QinQ outer tags and MPLS label stacks before the
        // IP dispatch.
        loop {
            match ethertype {
                ETH_P_VLAN | ETH_P_QINQ | ETH_P_QINQ_LEGACY => {
                    let vlan = match SingleVlanHeaderSlice::from_slice(&self.data[offset.min(self.data.len())..]) {
                        Ok(v) => v,
                        Err(e) => return self.stop(format!("vlan tag: {}", e)),
                    };
                    self.layers.tunnels.push("vlan");
                    ethertype = vlan.ether_type().0;
                    offset += 4;
                }
                ETH_P_MPLS_UC | ETH_P_MPLS_MC => {
                    self.layers.tunnels.push("mpls");
                    loop {
                        let Some(lse) = self.data.get(offset..offset + 4) else {
                            return self.stop("mpls label stack truncated");
                        };
                        let bottom = lse[2] & 0x01 != 0;
                        offset += 4;
                        if bottom {
                            break;
                        }
                    }
                    // MPLS carries no protocol field; sniff the IP version.
                    return self.walk_raw_ip(offset, depth + 1);
                }
                ETH_P_IPV4 => return self.walk_ip(offset, false, depth + 1),
                ETH_P_IPV6 => return self.walk_ip(offset, true, depth + 1),
                ETH_P_TEB => return self.walk_ethernet(offset, depth + 1),
                other => return self.stop(format!("unhandled ethertype 0x{:04x}", other)),
            }
        }
    }

    fn walk_ip(&mut self, offset: usize, is_v6: bool, depth: usize) {
        if depth > MAX_DEPTH {
            return self.stop("encapsulation deeper than supported");
        }
        if is_v6 {
            self.walk_ipv6(offset, depth)
        } else {
            self.walk_ipv4(offset, depth)
        }
    }

    fn walk_ipv4(&mut self, offset: usize, depth: usize) {
        let ip = match Ipv4HeaderSlice::from_slice(&self.data[offset.min(self.data.len())..]) {
            Ok(ip) => ip,
            Err(e) => return self.stop(format!("ipv4 header: {}", e)),
        };
        let header_len = usize::from(ip.ihl()) * 4;
        let total_len = usize::from(ip.total_len());
        let declared_end = offset + total_len.max(header_len);
        let end = declared_end.min(self.data.len());
        let payload_offset = offset + header_len;
        let payload_len = end.saturating_sub(payload_offset);
        let layer = IpLayer {
            offset,
            is_v6: false,
            header_len,
            src: IpAddr::V4(ip.source_addr()),
            dst: IpAddr::V4(ip.destination_addr()),
            src_offset: offset + 12,
            dst_offset: offset + 16,
            protocol: ip.protocol().0,
            payload_offset,
            payload_len,
            truncated: declared_end > self.data.len(),
            l4: L4::Other(ip.protocol().0),
        };
        let idx = self.layers.ip_layers.len();
        self.layers.ip_layers.push(layer);
        self.dispatch_l4(idx, depth);
    }

    fn walk_ipv6(&mut self, offset: usize, depth: usize) {
        let ip = match Ipv6HeaderSlice::from_slice(&self.data[offset.min(self.data.len())..]) {
            Ok(ip) => ip,
            Err(e) => return self.stop(format!("ipv6 header: {}", e)),
        };
        let declared_end = offset + 40 + usize::from(ip.payload_length());
        let end = declared_end.min(self.data.len());

        // Walk extension headers to the effective payload protocol.
        let mut protocol = ip.next_header().0;
        let mut payload_offset = offset + 40;
        let mut hops = 0;
        loop {
            let ext_len = match protocol {
                0 | 43 | 60 => {
                    // Hop-by-hop, routing, destination options: length in
                    // 8-byte units, excluding the first.
                    match self.data.get(payload_offset + 1) {
                        Some(l) => (usize::from(*l) + 1) * 8,
                        None => return self.stop("ipv6 extension header truncated"),
                    }
                }
                44 => 8, // fragment header is fixed size
                51 => {
                    // Authentication header: length in 4-byte units, minus 2.
                    match self.data.get(payload_offset + 1) {
                        Some(l) => (usize::from(*l) + 2) * 4,
                        None => return self.stop("ipv6 auth header truncated"),
                    }
                }
                _ => break,
            };
            protocol = match self.data.get(payload_offset) {
                Some(p) => *p,
                None => return self.stop("ipv6 extension header truncated"),
            };
            payload_offset += ext_len;
            hops += 1;
            if hops > MAX_DEPTH || payload_offset > end {
                return self.stop("ipv6 extension chain unreasonable");
            }
        }

        let layer = IpLayer {
            offset,
            is_v6: true,
            header_len: payload_offset - offset,
            src: IpAddr::V6(ip.source_addr()),
            dst: IpAddr::V6(ip.destination_addr()),
            src_offset: offset + 8,
            dst_offset: offset + 24,
            protocol,
            payload_offset,
            payload_len: end.saturating_sub(payload_offset),
            truncated: declared_end > self.data.len(),
            l4: L4::Other(protocol),
        };
        let idx = self.layers.ip_layers.len();
        self.layers.ip_layers.push(layer);
        self.dispatch_l4(idx, depth);
    }

    fn dispatch_l4(&mut self, idx: usize, depth: usize) {
        let (protocol, payload_offset, payload_len) = {
            let l = &self.layers.ip_layers[idx];
            (l.protocol, l.payload_offset, l.payload_len)
        };
        match protocol {
            IPPROTO_TCP => {
                let l4 = self.parse_tcp(payload_offset, payload_len);
                if let Some(l4) = l4 {
                    self.layers.ip_layers[idx].l4 = L4::Tcp(l4);
                }
            }
            IPPROTO_UDP => self.parse_udp(idx, payload_offset, payload_len, depth),
            IPPROTO_GRE => self.parse_gre(idx, payload_offset, payload_len, depth),
            IPPROTO_ICMP | IPPROTO_ICMPV6 => {
                if payload_len >= 4 {
                    self.layers.ip_layers[idx].l4 = L4::Icmp(IcmpLayer {
                        offset: payload_offset,
                        len: payload_len,
                        is_v6: protocol == IPPROTO_ICMPV6,
                        checksum_offset: payload_offset + 2,
                    });
                }
            }
            IPPROTO_IPIP => {
                self.layers.ip_layers[idx].l4 = L4::Encapsulated;
                self.layers.tunnels.push("ipip");
                self.walk_ip(payload_offset, false, depth + 1);
            }
            IPPROTO_IPV6 => {
                self.layers.ip_layers[idx].l4 = L4::Encapsulated;
                self.layers.tunnels.push("ipip");
                self.walk_ip(payload_offset, true, depth + 1);
            }
            _ => {}
        }
    }

    fn parse_tcp(&mut self, offset: usize, available: usize) -> Option<TcpLayer> {
        let end = (offset + available).min(self.data.len());
        let tcp = match TcpHeaderSlice::from_slice(&self.data[offset.min(end)..end]) {
            Ok(tcp) => tcp,
            Err(e) => {
                self.stop(format!("tcp header: {}", e));
                return None;
            }
        };
        let header_len = usize::from(tcp.data_offset()) * 4;
        if header_len < 20 || header_len > available {
            self.stop("tcp data offset out of range");
            return None;
        }
        Some(TcpLayer {
            offset,
            header_len,
            src_port: tcp.source_port(),
            dst_port: tcp.destination_port(),
            seq: tcp.sequence_number(),
            checksum_offset: offset + 16,
            payload_offset: offset + header_len,
            payload_len: available - header_len,
        })
    }

    fn parse_udp(&mut self, idx: usize, offset: usize, available: usize, depth: usize) {
        let end = (offset + available).min(self.data.len());
        let udp = match UdpHeaderSlice::from_slice(&self.data[offset.min(end)..end]) {
            Ok(udp) => udp,
            Err(e) => return self.stop(format!("udp header: {}", e)),
        };
        let src_port = udp.source_port();
        let dst_port = udp.destination_port();
        let layer = UdpLayer {
            offset,
            src_port,
            dst_port,
            checksum_offset: offset + 6,
            payload_offset: offset + 8,
            payload_len: available.saturating_sub(8),
            has_checksum: udp.checksum() != 0,
        };
        let payload_offset = layer.payload_offset;
        let payload_len = layer.payload_len;
        self.layers.ip_layers[idx].l4 = L4::Udp(layer);

        if dst_port == VXLAN_PORT || src_port == VXLAN_PORT {
            // VXLAN: 8-byte header with the I flag, then an inner Ethernet
            // frame.
            if payload_len >= 8 && self.data.get(payload_offset).is_some_and(|b| b & 0x08 != 0) {
                self.layers.tunnels.push("vxlan");
                self.walk_ethernet(payload_offset + 8, depth + 1);
            }
        } else if dst_port == GENEVE_PORT || src_port == GENEVE_PORT {
            // GENEVE: variable options length, protocol is an ethertype.
            if payload_len >= 8 {
                let opt_len = usize::from(self.data[payload_offset] & 0x3f) * 4;
                let proto = u16::from_be_bytes([
                    self.data[payload_offset + 2],
                    self.data[payload_offset + 3],
                ]);
                self.layers.tunnels.push("geneve");
                self.walk_ethertype(payload_offset + 8 + opt_len, proto, depth + 1);
            }
        }
    }

    fn parse_gre(&mut self, idx: usize, offset: usize, available: usize, depth: usize) {
        if available < 4 {
            return self.stop("gre header truncated");
        }
        let flags = self.data[offset];
        let version = self.data[offset + 1] & 0x07;
        if version != 0 {
            return self.stop(format!("gre version {} unsupported", version));
        }
        let has_checksum = flags & 0x80 != 0 || flags & 0x40 != 0;
        let mut header_len = 4;
        if has_checksum {
            header_len += 4;
        }
        if flags & 0x20 != 0 {
            header_len += 4; // key
        }
        if flags & 0x10 != 0 {
            header_len += 4; // sequence
        }
        if header_len > available {
            return self.stop("gre header truncated");
        }
        let proto = u16::from_be_bytes([self.data[offset + 2], self.data[offset + 3]]);
        self.layers.ip_layers[idx].l4 = L4::Gre(GreLayer {
            offset,
            header_len,
            checksum_offset: (flags & 0x80 != 0).then_some(offset + 4),
            span_len: available,
        });
        let inner = offset + header_len;
        match proto {
            ETH_P_IPV4 => {
                self.layers.tunnels.push("gre");
                self.walk_ip(inner, false, depth + 1);
            }
            ETH_P_IPV6 => {
                self.layers.tunnels.push("gre");
                self.walk_ip(inner, true, depth + 1);
            }
            ETH_P_TEB => {
                self.layers.tunnels.push("nvgre");
                self.walk_ethernet(inner, depth + 1);
            }
            ETH_P_ERSPAN2 => {
                self.layers.tunnels.push("erspan");
                self.walk_ethernet(inner + 8, depth + 1);
            }
            ETH_P_ERSPAN3 => {
                self.layers.tunnels.push("erspan");
                self.walk_ethernet(inner + 12, depth + 1);
            }
            ETH_P_MPLS_UC | ETH_P_MPLS_MC => {
                self.layers.tunnels.push("gre");
                self.walk_ethertype(inner, proto, depth + 1);
            }
            other => self.stop(format!("gre payload ethertype 0x{:04x} unsupported", other)),
        }
    }
}
