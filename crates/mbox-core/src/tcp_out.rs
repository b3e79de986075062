//! # TCPOut — egress half of a TCP direction
//!
//! Runs just before a packet leaves the middlebox on this direction: remaps
//! its sequence number through the modifications this direction has made so
//! far, clamps the ACK it carries so a lost manual ACK never causes a
//! regression, commits any pending rewrite to the byte-stream maintainer,
//! and — if a rewrite emptied the packet's payload entirely — forges a
//! replacement ACK on the dedicated synthetic-segment path instead of
//! letting an empty, uninformative segment through. Grounded on
//! `elements/middlebox/tcpout.cc`'s `TCPOut::push_batch`.

use mbox_wire::{Seq32, TcpPacket};

use crate::closing::ClosingState;
use crate::fcb::{Direction, TcpConnection};
use crate::modlist::ModificationList;
use crate::synthetic;

/// What a packet turns into on its way out. The middlebox has two distinct
/// output paths (the normal flow, and a side channel for segments the
/// middlebox forges itself), so both may fire for the same input packet.
#[derive(Default)]
pub struct TcpOutOutcome {
    /// The (possibly remapped) packet continuing on the normal path, or
    /// `None` if it carried nothing worth sending.
    pub primary: Option<TcpPacket>,
    /// A synthetic ACK forged on the side channel, if a rewrite emptied the
    /// packet's payload and the peer still needs acknowledging.
    pub synthetic_ack: Option<TcpPacket>,
}

pub struct TcpOut {
    direction: Direction,
}

impl TcpOut {
    pub fn new(direction: Direction) -> Self {
        TcpOut { direction }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// `modifications`, when present, is this packet's pending rewrite
    /// record (built upstream via [`FlowBuffer`](crate::flow_buffer::FlowBuffer)
    /// edits) and gets committed into this direction's maintainer here.
    /// `prev_payload_len` is the payload length *before* any such rewrite,
    /// needed to ack the bytes the original sender actually transmitted.
    pub fn process(
        &self,
        conn: &mut TcpConnection,
        mut packet: TcpPacket,
        modifications: Option<&mut ModificationList>,
        prev_payload_len: u32,
    ) -> TcpOutOutcome {
        let dir = self.direction;
        let other = dir.opposite();

        if !check_connection_closed(conn, dir, &packet) {
            return TcpOutOutcome::default();
        }

        let prev_seq = packet.tcp.seq;
        let new_seq = conn.maintainer(dir).map_seq(prev_seq);
        let prev_ack = packet.tcp.ack;
        let prev_last_ack = conn.maintainer(dir).last_ack_sent();

        if prev_seq != new_seq {
            packet.tcp.seq = new_seq;
        }

        conn.maintainer_mut(dir).set_last_seq_sent(new_seq);
        conn.maintainer_mut(dir).set_window_size(packet.tcp.window);

        if packet.tcp.is_ack() {
            conn.maintainer_mut(dir).set_last_ack_sent(prev_ack);
            // Never report an ACK lower than one already sent — covers a
            // manually-forged ACK getting lost and this packet needing to
            // carry the up-to-date value instead.
            packet.tcp.ack = conn.maintainer(dir).last_ack_sent().unwrap();
        }

        let mut outcome = TcpOutOutcome::default();

        if let Some(list) = modifications {
            list.commit(conn.maintainer_mut(dir));

            if packet.payload_len() == 0 {
                let ft = packet.five_tuple();
                let seq = Seq32::new(packet.annotations.init_ack);
                let mut ack = prev_seq.add(prev_payload_len);
                if packet.tcp.is_fin() || packet.tcp.is_syn() {
                    ack = ack.add(1);
                }

                let maintainer = conn.maintainer_mut(other);
                outcome.synthetic_ack = synthetic::send_ack(
                    maintainer,
                    ft.dst_ip,
                    ft.src_ip,
                    ft.dst_port,
                    ft.src_port,
                    seq,
                    ack,
                    false,
                );

                // The packet itself is now empty; if it also carries no
                // other new information, there's nothing left to send on
                // the normal path.
                if packet.is_just_an_ack() {
                    if let Some(last) = prev_last_ack {
                        if prev_ack.leq(last) {
                            return outcome;
                        }
                    }
                }
            }
        }

        let ip_src = packet.ip.src;
        let ip_dst = packet.ip.dst;
        let payload = packet.payload.clone();
        packet.tcp.fix_checksum(ip_src, ip_dst, &payload);

        // A rewrite upstream may have changed the payload length (or the
        // options re-padding inside `fix_checksum` may have changed the TCP
        // header length); `total_len` and the IP checksum covering it must
        // follow, matching `TcpPacket::encode`'s fixup.
        packet.ip.total_len =
            (packet.ip.header_len() + packet.tcp.header_len() + payload.len()) as u16;
        packet.ip.fix_checksum();

        outcome.primary = Some(packet);
        outcome
    }
}

/// Enforces the closing-state machine on the way out: a `BEING_CLOSED_*`
/// direction still transmits (it's in the process of winding down) but
/// watches for the segment that completes the teardown; a direction that's
/// already fully closed transmits nothing further. Grounded on
/// `TCPOut::checkConnectionClosed`.
fn check_connection_closed(conn: &mut TcpConnection, dir: Direction, packet: &TcpPacket) -> bool {
    match conn.closing_state(dir) {
        ClosingState::Open => true,
        ClosingState::BeingClosedGraceful => {
            if packet.tcp.is_fin() {
                conn.set_closing_state(dir, ClosingState::ClosedGraceful);
            }
            true
        }
        ClosingState::BeingClosedUngraceful => {
            if packet.tcp.is_rst() {
                conn.set_closing_state(dir, ClosingState::ClosedUngraceful);
            }
            true
        }
        ClosingState::ClosedGraceful | ClosingState::ClosedUngraceful => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mbox_wire::headers::{Ipv4Header, TcpFlags, TcpHeader, TcpOptions, IP_PROTO_TCP};
    use mbox_wire::FiveTuple;
    use std::net::Ipv4Addr;

    fn five_tuple() -> FiveTuple {
        FiveTuple::new(Ipv4Addr::new(10, 0, 0, 1), 1000, Ipv4Addr::new(10, 0, 0, 2), 80)
    }

    fn packet_at(seq: u32, ack: u32, payload: &'static [u8], flags: TcpFlags) -> TcpPacket {
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
                src: Ipv4Addr::new(10, 0, 0, 1),
                dst: Ipv4Addr::new(10, 0, 0, 2),
                options: Vec::new(),
            },
            tcp: TcpHeader {
                src_port: 1000,
                dst_port: 80,
                seq: Seq32::new(seq),
                ack: Seq32::new(ack),
                data_offset_words: 5,
                flags,
                window: 65535,
                checksum: 0,
                urgent_ptr: 0,
                options: TcpOptions::default(),
            },
            payload: Bytes::from_static(payload),
            annotations: Default::default(),
        }
    }

    #[test]
    fn remaps_sequence_number_through_prior_insertion() {
        let tcp_out = TcpOut::new(Direction::Forward);
        let mut conn = TcpConnection::new(five_tuple());
        conn.maintainer_mut(Direction::Forward).initialize(Seq32::new(0));
        conn.maintainer_mut(Direction::Forward).insert_in_seq_tree(Seq32::new(50), 10);

        let outcome = tcp_out.process(&mut conn, packet_at(100, 0, b"hi", TcpFlags::ACK), None, 2);
        let fwd = outcome.primary.unwrap();
        assert_eq!(fwd.tcp.seq, Seq32::new(110));
    }

    #[test]
    fn fully_closed_direction_drops_everything() {
        let tcp_out = TcpOut::new(Direction::Forward);
        let mut conn = TcpConnection::new(five_tuple());
        conn.maintainer_mut(Direction::Forward).initialize(Seq32::new(0));
        conn.set_closing_state(Direction::Forward, ClosingState::ClosedGraceful);

        let outcome = tcp_out.process(&mut conn, packet_at(0, 0, b"x", TcpFlags::ACK), None, 1);
        assert!(outcome.primary.is_none());
        assert!(outcome.synthetic_ack.is_none());
    }

    #[test]
    fn emptied_payload_forges_ack_on_the_other_directions_maintainer() {
        let tcp_out = TcpOut::new(Direction::Forward);
        let mut conn = TcpConnection::new(five_tuple());
        conn.maintainer_mut(Direction::Forward).initialize(Seq32::new(0));
        conn.maintainer_mut(Direction::Reverse).initialize(Seq32::new(0));

        let mut list = ModificationList::new();
        list.add_modification(Seq32::new(0), Seq32::new(0), -5);

        let outcome = tcp_out.process(
            &mut conn,
            packet_at(0, 10, b"", TcpFlags::ACK),
            Some(&mut list),
            5,
        );
        assert!(outcome.synthetic_ack.is_some());
    }

    #[test]
    fn last_ack_sent_never_regresses_on_egress() {
        let tcp_out = TcpOut::new(Direction::Forward);
        let mut conn = TcpConnection::new(five_tuple());
        conn.maintainer_mut(Direction::Forward).initialize(Seq32::new(0));
        conn.maintainer_mut(Direction::Forward).set_last_ack_sent(Seq32::new(500));

        let outcome = tcp_out.process(&mut conn, packet_at(0, 100, b"", TcpFlags::ACK), None, 0);
        let fwd = outcome.primary.unwrap();
        assert_eq!(fwd.tcp.ack, Seq32::new(500));
    }
}
