//! # Packet header codec
//!
//! Parses and re-serializes the Ethernet/IPv4/TCP headers the middlebox core
//! operates on. Unlike a general-purpose packet library this only decodes
//! what the core actually inspects or rewrites — IPv4 options beyond the
//! fixed 20 bytes are preserved as opaque bytes, not interpreted.
//!
//! ## IPv4 + TCP (no IPv6 — see spec Non-goals)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Version|  IHL  |Type of Service|          Total Length        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         Identification       |Flags|      Fragment Offset    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Time to Live |    Protocol   |         Header Checksum       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       Source Address                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Destination Address                       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use bytes::{Buf, BufMut, BytesMut};
use std::net::Ipv4Addr;

use crate::checksum::{fold_checksum, ipv4_pseudo_header_sum, ones_complement_sum};
use crate::seq::Seq32;

pub const ETHERNET_HEADER_LEN: usize = 14;
pub const IPV4_MIN_HEADER_LEN: usize = 20;
pub const TCP_MIN_HEADER_LEN: usize = 20;
pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const IP_PROTO_TCP: u8 = 6;

// ─── Five-tuple ──────────────────────────────────────────────────────────────

/// The 5-tuple identifying a TCP flow in one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FiveTuple {
    pub fn new(src_ip: Ipv4Addr, src_port: u16, dst_ip: Ipv4Addr, dst_port: u16) -> Self {
        FiveTuple {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
        }
    }

    /// The tuple as seen from the opposite direction of the same flow.
    pub fn reversed(&self) -> FiveTuple {
        FiveTuple {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }

    /// A key that identifies the flow regardless of direction, for the
    /// "exactly one `TcpConnection` per unordered 5-tuple" invariant.
    pub fn unordered_key(&self) -> (Ipv4Addr, Ipv4Addr, u16, u16) {
        if (self.src_ip, self.src_port) <= (self.dst_ip, self.dst_port) {
            (self.src_ip, self.dst_ip, self.src_port, self.dst_port)
        } else {
            (self.dst_ip, self.src_ip, self.dst_port, self.src_port)
        }
    }
}

// ─── Ethernet ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    pub dst_mac: [u8; 6],
    pub src_mac: [u8; 6],
    pub ethertype: u16,
}

impl EthernetHeader {
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < ETHERNET_HEADER_LEN {
            return None;
        }
        let mut dst_mac = [0u8; 6];
        let mut src_mac = [0u8; 6];
        buf.copy_to_slice(&mut dst_mac);
        buf.copy_to_slice(&mut src_mac);
        let ethertype = buf.get_u16();
        Some(EthernetHeader {
            dst_mac,
            src_mac,
            ethertype,
        })
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.extend_from_slice(&self.dst_mac);
        out.extend_from_slice(&self.src_mac);
        out.put_u16(self.ethertype);
    }
}

// ─── IPv4 ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    pub ihl_words: u8,
    pub tos: u8,
    pub total_len: u16,
    pub identification: u16,
    pub flags_frag_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    /// Raw bytes of any IPv4 options beyond the fixed 20-byte header.
    pub options: Vec<u8>,
}

impl Ipv4Header {
    pub fn header_len(&self) -> usize {
        self.ihl_words as usize * 4
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < IPV4_MIN_HEADER_LEN {
            return None;
        }
        let ver_ihl = buf.get_u8();
        if ver_ihl >> 4 != 4 {
            return None; // not IPv4 — out of scope
        }
        let ihl_words = ver_ihl & 0x0F;
        if ihl_words < 5 {
            return None;
        }
        let tos = buf.get_u8();
        let total_len = buf.get_u16();
        let identification = buf.get_u16();
        let flags_frag_offset = buf.get_u16();
        let ttl = buf.get_u8();
        let protocol = buf.get_u8();
        let checksum = buf.get_u16();
        let mut src_bytes = [0u8; 4];
        let mut dst_bytes = [0u8; 4];
        buf.copy_to_slice(&mut src_bytes);
        buf.copy_to_slice(&mut dst_bytes);

        let options_len = ihl_words as usize * 4 - IPV4_MIN_HEADER_LEN;
        if buf.remaining() < options_len {
            return None;
        }
        let mut options = vec![0u8; options_len];
        buf.copy_to_slice(&mut options);

        Some(Ipv4Header {
            ihl_words,
            tos,
            total_len,
            identification,
            flags_frag_offset,
            ttl,
            protocol,
            checksum,
            src: Ipv4Addr::from(src_bytes),
            dst: Ipv4Addr::from(dst_bytes),
            options,
        })
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u8((4 << 4) | self.ihl_words);
        out.put_u8(self.tos);
        out.put_u16(self.total_len);
        out.put_u16(self.identification);
        out.put_u16(self.flags_frag_offset);
        out.put_u8(self.ttl);
        out.put_u8(self.protocol);
        out.put_u16(self.checksum);
        out.extend_from_slice(&self.src.octets());
        out.extend_from_slice(&self.dst.octets());
        out.extend_from_slice(&self.options);
    }

    /// Recompute and set the header checksum over this header's own bytes.
    pub fn fix_checksum(&mut self) {
        self.checksum = 0;
        let mut scratch = BytesMut::with_capacity(self.header_len());
        self.encode(&mut scratch);
        let sum = ones_complement_sum(&scratch, 0);
        self.checksum = fold_checksum(sum);
    }

    pub fn verify_checksum(&self) -> bool {
        let mut copy = self.clone();
        let original = self.checksum;
        copy.fix_checksum();
        copy.checksum == original
    }
}

// ─── TCP ─────────────────────────────────────────────────────────────────────

/// Minimal bitflags support, hand-rolled to avoid pulling in the `bitflags`
/// crate for eight bits.
macro_rules! bitflags_lite {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $ty:ty {
            $(const $variant:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name(pub $ty);

        impl $name {
            $(pub const $variant: $name = $name($value);)*

            #[inline]
            pub fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            #[inline]
            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }

            #[inline]
            pub fn remove(&mut self, other: $name) {
                self.0 &= !other.0;
            }

            #[inline]
            pub fn bits(self) -> $ty {
                self.0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }
    };
}

bitflags_lite! {
    /// The 8 control bits of the TCP flags octet.
    pub struct TcpFlags: u8 {
        const FIN = 0b0000_0001;
        const SYN = 0b0000_0010;
        const RST = 0b0000_0100;
        const PSH = 0b0000_1000;
        const ACK = 0b0001_0000;
        const URG = 0b0010_0000;
        const ECE = 0b0100_0000;
        const CWR = 0b1000_0000;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpOptions {
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
    pub sack_permitted: bool,
    /// Any options bytes not specifically modeled above, preserved verbatim
    /// (NOP padding, timestamps, …) so re-encoding is lossless for them.
    pub other: Vec<u8>,
}

impl Default for TcpOptions {
    fn default() -> Self {
        TcpOptions {
            mss: None,
            window_scale: None,
            sack_permitted: false,
            other: Vec::new(),
        }
    }
}

impl TcpOptions {
    const KIND_EOL: u8 = 0;
    const KIND_NOP: u8 = 1;
    const KIND_MSS: u8 = 2;
    const KIND_WSCALE: u8 = 3;
    const KIND_SACK_PERMITTED: u8 = 4;

    pub fn parse(mut bytes: &[u8]) -> Self {
        let mut opts = TcpOptions::default();
        while !bytes.is_empty() {
            match bytes[0] {
                Self::KIND_EOL => break,
                Self::KIND_NOP => {
                    opts.other.push(Self::KIND_NOP);
                    bytes = &bytes[1..];
                }
                Self::KIND_MSS if bytes.len() >= 4 => {
                    opts.mss = Some(u16::from_be_bytes([bytes[2], bytes[3]]));
                    bytes = &bytes[4..];
                }
                Self::KIND_WSCALE if bytes.len() >= 3 => {
                    opts.window_scale = Some(bytes[2]);
                    bytes = &bytes[3..];
                }
                Self::KIND_SACK_PERMITTED if bytes.len() >= 2 => {
                    opts.sack_permitted = true;
                    bytes = &bytes[2..];
                }
                _ if bytes.len() >= 2 => {
                    let len = (bytes[1] as usize).max(2);
                    let len = len.min(bytes.len());
                    opts.other.extend_from_slice(&bytes[..len]);
                    bytes = &bytes[len..];
                }
                _ => break,
            }
        }
        opts
    }

    /// Re-encode, padded to a 4-byte boundary with NOPs then EOL.
    pub fn encode(&self, strip_sack_permitted: bool) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(mss) = self.mss {
            out.push(Self::KIND_MSS);
            out.push(4);
            out.extend_from_slice(&mss.to_be_bytes());
        }
        if !strip_sack_permitted && self.sack_permitted {
            out.push(Self::KIND_SACK_PERMITTED);
            out.push(2);
        }
        if let Some(shift) = self.window_scale {
            out.push(Self::KIND_WSCALE);
            out.push(3);
            out.push(shift);
        }
        out.extend_from_slice(&self.other);
        while out.len() % 4 != 0 {
            out.push(Self::KIND_EOL);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: Seq32,
    pub ack: Seq32,
    pub data_offset_words: u8,
    pub flags: TcpFlags,
    pub window: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
    pub options: TcpOptions,
}

impl TcpHeader {
    pub fn header_len(&self) -> usize {
        self.data_offset_words as usize * 4
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < TCP_MIN_HEADER_LEN {
            return None;
        }
        let src_port = buf.get_u16();
        let dst_port = buf.get_u16();
        let seq = Seq32::new(buf.get_u32());
        let ack = Seq32::new(buf.get_u32());
        let offset_reserved = buf.get_u8();
        let data_offset_words = offset_reserved >> 4;
        let flags_byte = buf.get_u8();
        let window = buf.get_u16();
        let checksum = buf.get_u16();
        let urgent_ptr = buf.get_u16();

        if data_offset_words < 5 {
            return None;
        }
        let options_len = data_offset_words as usize * 4 - TCP_MIN_HEADER_LEN;
        if buf.remaining() < options_len {
            return None;
        }
        let mut opt_bytes = vec![0u8; options_len];
        buf.copy_to_slice(&mut opt_bytes);

        Some(TcpHeader {
            src_port,
            dst_port,
            seq,
            ack,
            data_offset_words,
            flags: TcpFlags(flags_byte),
            window,
            checksum,
            urgent_ptr,
            options: TcpOptions::parse(&opt_bytes),
        })
    }

    /// Encode with options re-padded; updates `data_offset_words` in place
    /// to match. SACK-permitted is stripped from SYNs, matching the ingress
    /// option rewrite (§4.2).
    pub fn encode(&mut self, out: &mut BytesMut) {
        let strip_sack = self.is_syn();
        let opt_bytes = self.options.encode(strip_sack);
        self.data_offset_words = ((TCP_MIN_HEADER_LEN + opt_bytes.len()) / 4) as u8;

        out.put_u16(self.src_port);
        out.put_u16(self.dst_port);
        out.put_u32(self.seq.value());
        out.put_u32(self.ack.value());
        out.put_u8(self.data_offset_words << 4);
        out.put_u8(self.flags.bits());
        out.put_u16(self.window);
        out.put_u16(self.checksum);
        out.put_u16(self.urgent_ptr);
        out.extend_from_slice(&opt_bytes);
    }

    pub fn is_syn(&self) -> bool {
        self.flags.contains(TcpFlags::SYN)
    }
    pub fn is_ack(&self) -> bool {
        self.flags.contains(TcpFlags::ACK)
    }
    pub fn is_fin(&self) -> bool {
        self.flags.contains(TcpFlags::FIN)
    }
    pub fn is_rst(&self) -> bool {
        self.flags.contains(TcpFlags::RST)
    }

    /// Recompute the TCP checksum over the pseudo-header + this segment.
    pub fn fix_checksum(&mut self, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) {
        self.checksum = 0;
        let mut scratch = BytesMut::new();
        self.encode(&mut scratch);
        let tcp_len = scratch.len() + payload.len();
        let seed = ipv4_pseudo_header_sum(src.octets(), dst.octets(), IP_PROTO_TCP, tcp_len as u16);
        let mut sum = ones_complement_sum(&scratch, seed);
        sum = ones_complement_sum(payload, sum);
        self.checksum = fold_checksum(sum);
    }
}

// ─── Packet annotations ──────────────────────────────────────────────────────

/// Per-packet side-channel state threaded through the pipeline alongside the
/// wire bytes (spec §6.2). Not part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Annotations {
    /// Offset of the payload relative to the start of packet data.
    pub content_offset: u16,
    /// The ACK number as originally observed on ingress, preserved across
    /// the pipeline for use by synthetic-ACK emission.
    pub init_ack: u32,
    flags: u8,
}

impl Annotations {
    const FLAG_DIRTY: u8 = 0b01;
    const FLAG_LAST_USEFUL: u8 = 0b10;

    pub fn dirty(&self) -> bool {
        self.flags & Self::FLAG_DIRTY != 0
    }
    pub fn set_dirty(&mut self, v: bool) {
        if v {
            self.flags |= Self::FLAG_DIRTY;
        } else {
            self.flags &= !Self::FLAG_DIRTY;
        }
    }
    pub fn last_useful(&self) -> bool {
        self.flags & Self::FLAG_LAST_USEFUL != 0
    }
    pub fn set_last_useful(&mut self, v: bool) {
        if v {
            self.flags |= Self::FLAG_LAST_USEFUL;
        } else {
            self.flags &= !Self::FLAG_LAST_USEFUL;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tcp() -> TcpHeader {
        TcpHeader {
            src_port: 5000,
            dst_port: 80,
            seq: Seq32::new(100),
            ack: Seq32::new(0),
            data_offset_words: 5,
            flags: TcpFlags::SYN,
            window: 65535,
            checksum: 0,
            urgent_ptr: 0,
            options: TcpOptions::default(),
        }
    }

    #[test]
    fn tcp_header_roundtrip() {
        let mut hdr = sample_tcp();
        hdr.options.mss = Some(1460);
        hdr.options.window_scale = Some(7);
        hdr.options.sack_permitted = true;

        let mut buf = BytesMut::new();
        hdr.encode(&mut buf);
        let mut frozen = buf.freeze();
        let decoded = TcpHeader::decode(&mut frozen).unwrap();

        assert_eq!(decoded.src_port, 5000);
        assert_eq!(decoded.seq, Seq32::new(100));
        assert!(decoded.is_syn());
        assert_eq!(decoded.options.mss, Some(1460));
        assert_eq!(decoded.options.window_scale, Some(7));
        assert!(decoded.options.sack_permitted);
    }

    #[test]
    fn tcp_flags_helpers() {
        let mut flags = TcpFlags::SYN;
        flags.insert(TcpFlags::ACK);
        assert!(flags.contains(TcpFlags::SYN));
        assert!(flags.contains(TcpFlags::ACK));
        flags.remove(TcpFlags::SYN);
        assert!(!flags.contains(TcpFlags::SYN));
        assert!(flags.contains(TcpFlags::ACK));
    }

    #[test]
    fn ipv4_checksum_roundtrip() {
        let mut hdr = Ipv4Header {
            ihl_words: 5,
            tos: 0,
            total_len: 40,
            identification: 1,
            flags_frag_offset: 0,
            ttl: 64,
            protocol: IP_PROTO_TCP,
            checksum: 0,
            src: Ipv4Addr::new(10, 0, 0, 1),
            dst: Ipv4Addr::new(10, 0, 0, 2),
            options: Vec::new(),
        };
        hdr.fix_checksum();
        assert!(hdr.verify_checksum());

        hdr.ttl = 63; // corrupt something covered by the checksum
        assert!(!hdr.verify_checksum());
    }

    #[test]
    fn five_tuple_unordered_key_symmetric() {
        let fwd = FiveTuple::new(
            Ipv4Addr::new(10, 0, 0, 1),
            5000,
            Ipv4Addr::new(10, 0, 0, 2),
            80,
        );
        let rev = fwd.reversed();
        assert_eq!(fwd.unordered_key(), rev.unordered_key());
    }

    #[test]
    fn tcp_options_parse_skips_unknown_and_nop() {
        let raw = [1u8, 1, 8, 10, 0, 0, 0, 1, 0, 0, 0, 2]; // NOP NOP TIMESTAMP(10)
        let opts = TcpOptions::parse(&raw);
        assert!(opts.mss.is_none());
        assert!(!opts.other.is_empty());
    }

    #[test]
    fn tcp_checksum_changes_with_payload() {
        let mut hdr = sample_tcp();
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        hdr.fix_checksum(src, dst, b"hello");
        let c1 = hdr.checksum;
        hdr.fix_checksum(src, dst, b"world!");
        assert_ne!(c1, hdr.checksum);
    }
}
