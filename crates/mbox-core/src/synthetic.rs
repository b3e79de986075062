//! # Synthetic segments
//!
//! `TCPIn` re-ACKs content the peer already has, and `TCPOut` answers for a
//! packet whose payload was rewritten down to nothing, or closes a flow
//! locally — in each case a bare ACK/FIN/RST segment is forged from scratch
//! rather than derived from an observed packet. Grounded on
//! `elements/middlebox/tcpout.cc`'s `sendAck`/`sendClosingPacket`.

use std::net::Ipv4Addr;

use bytes::Bytes;
use mbox_wire::{
    Annotations, Ipv4Header, Seq32, TcpFlags, TcpHeader, TcpOptions, TcpPacket, IP_PROTO_TCP,
};

use crate::maintainer::ByteStreamMaintainer;

/// Build a bare TCP/IPv4 segment with no payload and no Ethernet framing.
pub fn forge_packet(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: Seq32,
    ack: Seq32,
    window: u16,
    flags: TcpFlags,
) -> TcpPacket {
    TcpPacket {
        ethernet: None,
        ip: Ipv4Header {
            ihl_words: 5,
            tos: 0,
            total_len: 0,
            identification: 0,
            flags_frag_offset: 0,
            ttl: 64,
            protocol: IP_PROTO_TCP,
            checksum: 0,
            src,
            dst,
            options: Vec::new(),
        },
        tcp: TcpHeader {
            src_port,
            dst_port,
            seq,
            ack,
            data_offset_words: 5,
            flags,
            window,
            checksum: 0,
            urgent_ptr: 0,
            options: TcpOptions::default(),
        },
        payload: Bytes::new(),
        annotations: Annotations::default(),
    }
}

/// Forge and gate an ACK-only segment on behalf of `maintainer` (the
/// receiving side's own state): skip it if it wouldn't tell the peer
/// anything new, never let its sequence number regress behind the last one
/// sent, and record it as the last ACK sent.
pub fn send_ack(
    maintainer: &mut ByteStreamMaintainer,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    mut seq: Seq32,
    ack: Seq32,
    force: bool,
) -> Option<TcpPacket> {
    if !force {
        if let Some(last) = maintainer.last_ack_sent() {
            if ack.leq(last) {
                return None;
            }
        }
    }

    maintainer.set_last_ack_sent(ack);

    if let Some(last_seq) = maintainer.last_seq_sent() {
        if seq.lt(last_seq) {
            seq = last_seq;
        }
    }

    Some(forge_packet(
        src,
        dst,
        src_port,
        dst_port,
        seq,
        ack,
        maintainer.window_size(),
        TcpFlags::ACK,
    ))
}

/// Forge a FIN or RST segment to close a flow from the middlebox's side.
pub fn send_closing_packet(
    maintainer: &mut ByteStreamMaintainer,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    mut seq: Seq32,
    ack: Seq32,
    graceful: bool,
) -> TcpPacket {
    maintainer.set_last_ack_sent(ack);

    if let Some(last_seq) = maintainer.last_seq_sent() {
        if seq.lt(last_seq) {
            seq = last_seq;
        }
    }

    let mut flags = TcpFlags::ACK;
    if graceful {
        flags.insert(TcpFlags::FIN);
        // Further packets on this side must see seq + 1 for the FIN byte.
        maintainer.set_last_seq_sent(seq.add(1));
    } else {
        flags.insert(TcpFlags::RST);
    }

    forge_packet(src, dst, src_port, dst_port, seq, ack, maintainer.window_size(), flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addrs() -> (Ipv4Addr, Ipv4Addr) {
        (Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2))
    }

    #[test]
    fn send_ack_is_skipped_when_not_new_and_not_forced() {
        let mut m = ByteStreamMaintainer::new();
        m.set_last_ack_sent(Seq32::new(100));
        let (a, b) = addrs();
        let ack = send_ack(&mut m, a, b, 1000, 80, Seq32::new(0), Seq32::new(50), false);
        assert!(ack.is_none());
    }

    #[test]
    fn send_ack_forced_goes_through_and_updates_last_ack_sent() {
        let mut m = ByteStreamMaintainer::new();
        m.set_last_ack_sent(Seq32::new(100));
        let (a, b) = addrs();
        let ack = send_ack(&mut m, a, b, 1000, 80, Seq32::new(0), Seq32::new(50), true);
        assert!(ack.is_some());
        assert_eq!(m.last_ack_sent(), Some(Seq32::new(50)));
    }

    #[test]
    fn send_closing_packet_graceful_advances_last_seq_sent_past_fin() {
        let mut m = ByteStreamMaintainer::new();
        let (a, b) = addrs();
        let pkt = send_closing_packet(&mut m, a, b, 1000, 80, Seq32::new(10), Seq32::new(20), true);
        assert!(pkt.tcp.is_fin());
        assert_eq!(m.last_seq_sent(), Some(Seq32::new(11)));
    }

    #[test]
    fn send_closing_packet_ungraceful_sets_rst() {
        let mut m = ByteStreamMaintainer::new();
        let (a, b) = addrs();
        let pkt = send_closing_packet(&mut m, a, b, 1000, 80, Seq32::new(10), Seq32::new(20), false);
        assert!(pkt.tcp.is_rst());
    }
}
