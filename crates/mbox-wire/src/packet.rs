//! A decoded packet bundling its Ethernet/IPv4/TCP headers, payload, and the
//! pipeline-local [`Annotations`] threaded alongside it.
//!
//! The middlebox core only ever deals in TCP/IPv4 segments, so unlike a
//! general-purpose packet type this has no enum of protocol variants —
//! non-TCP or non-IPv4 traffic is rejected at [`TcpPacket::parse`].

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::checksum::{fold_checksum, ipv4_pseudo_header_sum, ones_complement_sum};
use crate::headers::{
    Annotations, EthernetHeader, FiveTuple, Ipv4Header, TcpHeader, ETHERTYPE_IPV4, IP_PROTO_TCP,
};

#[derive(Debug, Clone)]
pub struct TcpPacket {
    pub ethernet: Option<EthernetHeader>,
    pub ip: Ipv4Header,
    pub tcp: TcpHeader,
    pub payload: Bytes,
    pub annotations: Annotations,
}

impl TcpPacket {
    /// Parse a packet that starts with an Ethernet header. Driver setups
    /// that hand packets over at L3 should go through [`parse_l3`](Self::parse_l3)
    /// instead.
    pub fn parse(mut bytes: Bytes) -> Option<Self> {
        let ethernet = EthernetHeader::decode(&mut bytes)?;
        if ethernet.ethertype != ETHERTYPE_IPV4 {
            return None;
        }
        Self::parse_ip(bytes, Some(ethernet))
    }

    pub fn parse_l3(bytes: Bytes) -> Option<Self> {
        Self::parse_ip(bytes, None)
    }

    fn parse_ip(mut bytes: Bytes, ethernet: Option<EthernetHeader>) -> Option<Self> {
        let ip = Ipv4Header::decode(&mut bytes)?;
        if ip.protocol != IP_PROTO_TCP {
            return None;
        }
        let tcp = TcpHeader::decode(&mut bytes)?;
        let header_len = ip.header_len()
            + tcp.header_len()
            + ethernet
                .map(|_| crate::headers::ETHERNET_HEADER_LEN)
                .unwrap_or(0);
        let payload = bytes.copy_to_bytes(bytes.remaining());

        let mut annotations = Annotations::default();
        annotations.content_offset = header_len.min(u16::MAX as usize) as u16;
        annotations.init_ack = tcp.ack.value();

        Some(TcpPacket {
            ethernet,
            ip,
            tcp,
            payload,
            annotations,
        })
    }

    pub fn five_tuple(&self) -> FiveTuple {
        FiveTuple::new(self.ip.src, self.tcp.src_port, self.ip.dst, self.tcp.dst_port)
    }

    /// Re-serialize this packet, recomputing both checksums over the
    /// current header + payload state.
    pub fn encode(&mut self) -> BytesMut {
        self.tcp.fix_checksum(self.ip.src, self.ip.dst, &self.payload);

        let mut tcp_bytes = BytesMut::new();
        self.tcp.encode(&mut tcp_bytes);
        self.ip.total_len = (self.ip.header_len() + tcp_bytes.len() + self.payload.len()) as u16;
        self.ip.fix_checksum();

        let mut out = BytesMut::with_capacity(
            self.ethernet.map(|_| crate::headers::ETHERNET_HEADER_LEN).unwrap_or(0)
                + self.ip.header_len()
                + tcp_bytes.len()
                + self.payload.len(),
        );
        if let Some(eth) = &self.ethernet {
            eth.encode(&mut out);
        }
        self.ip.encode(&mut out);
        out.extend_from_slice(&tcp_bytes);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn payload_len(&self) -> u32 {
        self.payload.len() as u32
    }

    /// No payload and no flags set beyond ACK — carries no information
    /// besides acknowledging previously seen bytes.
    pub fn is_just_an_ack(&self) -> bool {
        self.payload.is_empty() && self.tcp.flags == crate::headers::TcpFlags::ACK
    }

    /// The sequence number one past the end of this segment, accounting for
    /// SYN/FIN each consuming one sequence number (RFC 793 §3.3).
    pub fn next_seq(&self) -> crate::seq::Seq32 {
        let mut next = self.tcp.seq.add(self.payload_len());
        if self.tcp.is_syn() || self.tcp.is_fin() {
            next = next.add(1);
        }
        next
    }

    /// Recompute just the TCP checksum, seeded with the IPv4 pseudo-header,
    /// without touching the IP header's own checksum or total length.
    pub fn tcp_checksum(&self) -> u16 {
        let mut scratch = BytesMut::new();
        let mut tcp = self.tcp.clone();
        tcp.checksum = 0;
        tcp.encode(&mut scratch);
        let tcp_len = scratch.len() + self.payload.len();
        let seed = ipv4_pseudo_header_sum(
            self.ip.src.octets(),
            self.ip.dst.octets(),
            IP_PROTO_TCP,
            tcp_len as u16,
        );
        let sum = ones_complement_sum(&scratch, seed);
        let sum = ones_complement_sum(&self.payload, sum);
        fold_checksum(sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::{TcpFlags, TcpOptions};
    use crate::seq::Seq32;
    use std::net::Ipv4Addr;

    fn sample() -> TcpPacket {
        TcpPacket {
            ethernet: None,
            ip: Ipv4Header {
                ihl_words: 5,
                tos: 0,
                total_len: 0,
                identification: 1,
                flags_frag_offset: 0,
                ttl: 64,
                protocol: IP_PROTO_TCP,
                checksum: 0,
                src: Ipv4Addr::new(10, 0, 0, 1),
                dst: Ipv4Addr::new(10, 0, 0, 2),
                options: Vec::new(),
            },
            tcp: TcpHeader {
                src_port: 1234,
                dst_port: 80,
                seq: Seq32::new(1000),
                ack: Seq32::new(0),
                data_offset_words: 5,
                flags: TcpFlags::ACK,
                window: 65535,
                checksum: 0,
                urgent_ptr: 0,
                options: TcpOptions::default(),
            },
            payload: Bytes::from_static(b"hello"),
            annotations: Annotations::default(),
        }
    }

    #[test]
    fn encode_then_parse_l3_roundtrips_headers() {
        let mut pkt = sample();
        let bytes = pkt.encode().freeze();
        let parsed = TcpPacket::parse_l3(bytes).unwrap();
        assert_eq!(parsed.tcp.seq, Seq32::new(1000));
        assert_eq!(parsed.payload, Bytes::from_static(b"hello"));
        assert!(parsed.ip.verify_checksum());
    }

    #[test]
    fn next_seq_accounts_for_syn() {
        let mut pkt = sample();
        pkt.tcp.flags.insert(TcpFlags::SYN);
        assert_eq!(pkt.next_seq(), Seq32::new(1000 + 5 + 1));
    }

    #[test]
    fn five_tuple_matches_headers() {
        let pkt = sample();
        let ft = pkt.five_tuple();
        assert_eq!(ft.src_port, 1234);
        assert_eq!(ft.dst_port, 80);
    }
}
