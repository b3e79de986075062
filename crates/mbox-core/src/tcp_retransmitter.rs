//! # TCPRetransmitter — middlebox-originated resends
//!
//! Whenever the middlebox ACKs data on the real sender's behalf (because a
//! downstream rewriter or the reorderer already delivered it), it takes on
//! the responsibility of actually getting those bytes to the receiver. This
//! module buffers everything acked-but-not-yet-peer-acked in a
//! [`CircularBuffer`](crate::retransmit::CircularBuffer) per direction and
//! answers retransmission requests (packets re-sent for content that may
//! have since been rewritten) out of that buffer instead of forwarding the
//! sender's original bytes verbatim. Grounded on
//! `elements/middlebox/tcpretransmitter.cc`.

use mbox_wire::{Seq32, TcpFlags, TcpPacket};

use crate::closing::ClosingState;
use crate::fcb::{Direction, TcpConnection};
use crate::retransmit::{clamp_to_windows, RtoPhase};
use crate::synthetic::forge_packet;

pub struct TcpRetransmitter {
    direction: Direction,
}

impl TcpRetransmitter {
    pub fn new(direction: Direction) -> Self {
        TcpRetransmitter { direction }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Input 0: a packet on its normal path. Buffer its payload so it can be
    /// resent later, and if the middlebox has already ACKed these bytes to
    /// the peer (an ACK-before-the-data situation caused by a forged ACK),
    /// hold the packet back and prime a manual retransmission instead of
    /// letting it go out stale.
    pub fn process_normal(
        &self,
        conn: &mut TcpConnection,
        packet: TcpPacket,
        now: quanta::Instant,
    ) -> Option<TcpPacket> {
        let dir = self.direction;
        let other = dir.opposite();

        let seq = packet.tcp.seq;
        let payload_len = packet.payload_len();

        if payload_len == 0 {
            return Some(packet);
        }

        conn.retransmit_mut(dir).buffer.add_data_at_end(seq, &packet.payload);

        let last_ack_sent = conn.maintainer(other).last_ack_sent();

        let mut ack_to_receive = seq.add(payload_len);
        if packet.tcp.is_fin() || packet.tcp.is_syn() {
            ack_to_receive = ack_to_receive.add(1);
        }
        let ack_to_receive_mapped = conn.maintainer(dir).map_ack(ack_to_receive);

        if let Some(last_ack_sent) = last_ack_sent {
            if ack_to_receive_mapped.leq(last_ack_sent) {
                // The middlebox already told the peer it has this data —
                // this packet is stale. Start the timer so the real bytes
                // get (re)sent out of the buffer instead.
                conn.retransmit_mut(dir).start_timer(now);

                let size = clamp_to_windows(
                    payload_len,
                    0,
                    conn.maintainer(other).congestion_window(),
                    conn.maintainer(dir).window_size() as u64,
                    false,
                );
                if size == 0 {
                    return None;
                }
                conn.retransmit_mut(dir).set_last_manual_transmission(ack_to_receive);
            }
        }

        conn.retransmit_mut(dir).start_rtt_measure(seq, now);
        Some(packet)
    }

    /// Input 1: a retransmission the real sender re-sent on its own
    /// initiative. Map it onto this direction's rewritten byte stream and
    /// substitute the buffered (possibly rewritten) content rather than
    /// forwarding the sender's stale bytes.
    pub fn process_retransmission(
        &self,
        conn: &mut TcpConnection,
        mut packet: TcpPacket,
    ) -> Option<TcpPacket> {
        let dir = self.direction;
        let other = dir.opposite();

        if conn.closing_state(dir) != ClosingState::Open {
            return None;
        }

        let seq = packet.tcp.seq;
        let last_ack_sent = conn.maintainer(other).last_ack_sent().unwrap_or(Seq32::ZERO);

        if seq.lt(last_ack_sent) {
            // Already-acked data retransmitted: the peer must have missed
            // our ACK. Drop it and let the peer re-request that ACK rather
            // than forwarding redundant bytes.
            packet.annotations.init_ack = packet.tcp.ack.value();
            return None;
        }

        let mapped_seq = conn.maintainer(dir).map_seq(seq);
        let payload_len = packet.payload_len();
        let mapped_seq_end = conn.maintainer(dir).map_seq(seq.add(payload_len));

        if payload_len == 0 && (packet.tcp.is_fin() || packet.tcp.is_rst()) {
            let ack = conn.maintainer(other).map_ack(packet.tcp.ack);
            packet.tcp.ack = ack;
            packet.tcp.seq = mapped_seq;
            let (src, dst) = (packet.ip.src, packet.ip.dst);
            let payload = packet.payload.clone();
            packet.tcp.fix_checksum(src, dst, &payload);
            packet.ip.total_len =
                (packet.ip.header_len() + packet.tcp.header_len() + payload.len()) as u16;
            packet.ip.fix_checksum();
            return Some(packet);
        }

        let size_of_retransmission = mapped_seq_end.distance(mapped_seq).max(0) as usize;
        if size_of_retransmission == 0 {
            return None;
        }

        let data = conn.retransmit(dir).buffer.get_data(mapped_seq, size_of_retransmission);
        let ack = conn.maintainer(other).map_ack(packet.tcp.ack);

        packet.tcp.ack = ack;
        packet.tcp.seq = mapped_seq;
        packet.payload = bytes::Bytes::from(data);

        let (src, dst) = (packet.ip.src, packet.ip.dst);
        let payload = packet.payload.clone();
        packet.tcp.fix_checksum(src, dst, &payload);
        packet.ip.total_len =
            (packet.ip.header_len() + packet.tcp.header_len() + payload.len()) as u16;
        packet.ip.fix_checksum();

        conn.retransmit_mut(dir).signal_retransmission(mapped_seq.add(payload_len));

        Some(packet)
    }

    /// Drop buffered bytes the peer has already acked.
    pub fn prune(&self, conn: &mut TcpConnection) {
        let dir = self.direction;
        let other = dir.opposite();
        if let Some(last_ack_received) = conn.maintainer(other).last_ack_received() {
            conn.retransmit_mut(dir).buffer.remove_data_at_beginning(last_ack_received);
        }
    }

    /// Is there buffered, manually-acked data still waiting for the peer's
    /// own ACK to catch up?
    pub fn data_to_retransmit(&self, conn: &TcpConnection) -> bool {
        let dir = self.direction;
        let other = dir.opposite();
        let maintainer = conn.maintainer(other);
        let (Some(_last_sent), Some(_last_received)) =
            (maintainer.last_ack_sent(), maintainer.last_ack_received())
        else {
            return false;
        };

        let buffer = &conn.retransmit(dir).buffer;
        if buffer.is_empty() || buffer.is_blank() {
            return false;
        }
        let Some(start_offset) = buffer.start_offset() else { return false };
        let last_ack_sent = conn.maintainer(dir).map_seq(maintainer.last_ack_sent().unwrap());
        start_offset.lt(last_ack_sent)
    }

    /// The RTO timer fired: this direction lost data in flight. Halve the
    /// opposite direction's congestion window (down to `2*mss`) and force a
    /// manual retransmission, doubling the RTO since this was a genuine
    /// timeout rather than a fast retransmit.
    pub fn on_timer_fired(&self, conn: &mut TcpConnection) {
        let dir = self.direction;
        let other = dir.opposite();

        let mss = conn.maintainer(other).mss() as u64;
        let cwnd = conn.maintainer(dir).congestion_window();
        let ssthresh = (cwnd / 2).max(2 * mss);
        conn.maintainer_mut(dir).set_ssthresh(ssthresh);
        conn.maintainer_mut(dir).set_congestion_window(mss);

        if let Some(last_received) = conn.maintainer(other).last_ack_received() {
            conn.retransmit_mut(dir).set_last_manual_transmission(last_received);
        }
        conn.retransmit_mut(dir).on_timer_fired();
    }

    /// Called on a periodic sweep over live connections: if this direction's
    /// RTO has genuinely elapsed (as opposed to a dup-ACK [`fire_now`](
    /// crate::retransmit::RetransmitState::fire_now) fast retransmit), fire
    /// the timeout bookkeeping and pull the actual resend out of the
    /// retransmission buffer. Returns `None` if the timer isn't due, or if
    /// there's nothing left in the buffer to resend.
    pub fn poll_timer(&self, conn: &mut TcpConnection, now: quanta::Instant) -> Option<TcpPacket> {
        let dir = self.direction;

        let due = conn.retransmit(dir).deadline().is_some_and(|deadline| now >= deadline);
        if due {
            self.on_timer_fired(conn);
        }

        if conn.retransmit(dir).phase() != RtoPhase::Retry {
            return None;
        }

        self.emit_retransmission(conn, now)
    }

    /// Forge a segment carrying the next unacknowledged bytes out of this
    /// direction's retransmission buffer, starting at
    /// [`RetransmitState::last_manual_transmission`]. Mirrors
    /// `TCPRetransmitter::resend` pulling resend data out of
    /// `retransmit_list` instead of re-asking the real sender for it.
    fn emit_retransmission(&self, conn: &mut TcpConnection, now: quanta::Instant) -> Option<TcpPacket> {
        let dir = self.direction;
        let other = dir.opposite();

        let seq = conn.retransmit(dir).last_manual_transmission()?;
        let mss = conn.maintainer(other).mss() as u32;
        let cwnd = conn.maintainer(dir).congestion_window();
        let window = conn.maintainer(other).window_size() as u64;

        let size = clamp_to_windows(mss, 0, cwnd, window, true) as usize;
        if size == 0 {
            return None;
        }

        let data = conn.retransmit(dir).buffer.get_data(seq, size);
        if data.is_empty() {
            return None;
        }

        let ft = if dir == Direction::Forward { conn.five_tuple } else { conn.five_tuple.reversed() };
        let ack = conn.maintainer(dir).last_ack_sent().unwrap_or(Seq32::ZERO);
        let payload_len = data.len() as u32;

        let mut packet = forge_packet(
            ft.src_ip,
            ft.dst_ip,
            ft.src_port,
            ft.dst_port,
            seq,
            ack,
            conn.maintainer(dir).window_size(),
            TcpFlags::ACK,
        );
        packet.payload = bytes::Bytes::from(data);
        packet.tcp.fix_checksum(ft.src_ip, ft.dst_ip, &packet.payload);
        packet.ip.total_len =
            (packet.ip.header_len() + packet.tcp.header_len() + packet.payload.len()) as u16;
        packet.ip.fix_checksum();

        conn.retransmit_mut(dir).set_last_manual_transmission(seq.add(payload_len));
        conn.retransmit_mut(dir).restart_timer(now);

        Some(packet)
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
    fn normal_packet_is_buffered_and_forwarded() {
        let rt = TcpRetransmitter::new(Direction::Forward);
        let mut conn = TcpConnection::new(five_tuple());
        conn.maintainer_mut(Direction::Forward).initialize(Seq32::new(0));
        conn.maintainer_mut(Direction::Reverse).initialize(Seq32::new(0));

        let now = quanta::Instant::now();
        let out = rt.process_normal(&mut conn, packet_at(100, 0, b"hello", TcpFlags::ACK), now);
        assert!(out.is_some());
        assert_eq!(
            conn.retransmit(Direction::Forward).buffer.get_data(Seq32::new(100), 5),
            b"hello"
        );
    }

    #[test]
    fn retransmission_substitutes_buffered_content() {
        let rt = TcpRetransmitter::new(Direction::Forward);
        let mut conn = TcpConnection::new(five_tuple());
        conn.maintainer_mut(Direction::Forward).initialize(Seq32::new(0));
        conn.maintainer_mut(Direction::Reverse).initialize(Seq32::new(0));
        conn.retransmit_mut(Direction::Forward).buffer.add_data_at_end(Seq32::new(100), b"BBBBB");

        let pkt = packet_at(100, 0, b"AAAAA", TcpFlags::ACK);
        let out = rt.process_retransmission(&mut conn, pkt).unwrap();
        assert_eq!(out.payload, Bytes::from_static(b"BBBBB"));
    }

    #[test]
    fn retransmission_on_closed_direction_is_dropped() {
        let rt = TcpRetransmitter::new(Direction::Forward);
        let mut conn = TcpConnection::new(five_tuple());
        conn.maintainer_mut(Direction::Forward).initialize(Seq32::new(0));
        conn.set_closing_state(Direction::Forward, ClosingState::ClosedGraceful);

        let out = rt.process_retransmission(&mut conn, packet_at(100, 0, b"x", TcpFlags::ACK));
        assert!(out.is_none());
    }

    #[test]
    fn poll_timer_emits_buffered_bytes_once_the_rto_elapses() {
        let rt = TcpRetransmitter::new(Direction::Forward);
        let mut conn = TcpConnection::new(five_tuple());
        conn.maintainer_mut(Direction::Forward).initialize(Seq32::new(0));
        conn.maintainer_mut(Direction::Reverse).initialize(Seq32::new(0));
        conn.retransmit_mut(Direction::Forward).buffer.add_data_at_end(Seq32::new(100), b"hello");
        conn.maintainer_mut(Direction::Reverse).set_last_ack_received(Seq32::new(100));

        let now = quanta::Instant::now();
        conn.retransmit_mut(Direction::Forward).start_timer(now);
        assert!(rt.poll_timer(&mut conn, now).is_none(), "timer not yet due");

        let rto = conn.retransmit(Direction::Forward).rto();
        let fired = rt.poll_timer(&mut conn, now + rto);
        let packet = fired.expect("retransmission emitted once the rto elapses");
        assert_eq!(packet.payload, Bytes::from_static(b"hello"));
        assert_eq!(packet.tcp.seq, Seq32::new(100));
    }

    #[test]
    fn prune_removes_acked_prefix() {
        let rt = TcpRetransmitter::new(Direction::Forward);
        let mut conn = TcpConnection::new(five_tuple());
        conn.maintainer_mut(Direction::Forward).initialize(Seq32::new(0));
        conn.maintainer_mut(Direction::Reverse).initialize(Seq32::new(0));
        conn.retransmit_mut(Direction::Forward).buffer.add_data_at_end(Seq32::new(0), b"0123456789");
        conn.maintainer_mut(Direction::Reverse).set_last_ack_received(Seq32::new(5));

        rt.prune(&mut conn);
        assert_eq!(conn.retransmit(Direction::Forward).buffer.len(), 5);
    }
}
