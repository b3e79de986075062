//! # TCP reorderer
//!
//! Holds out-of-order segments until the gap before them is filled, then
//! releases a run of now-contiguous packets in sequence order. A SYN resets
//! `expected_seq` and flushes anything waiting (a SYN must always be the
//! first packet of a flow). A segment that arrives below `expected_seq` is
//! a retransmission and is handed to the caller separately rather than
//! re-inserted.

use std::collections::VecDeque;

use mbox_wire::{Seq32, TcpPacket};

/// What to do with a packet handed to [`Reorderer::push`].
pub enum ReorderOutcome {
    /// Packet(s) are ready to continue downstream, in sequence order.
    Ready(Vec<TcpPacket>),
    /// Packet is buffered, waiting for a gap to close.
    Buffered,
    /// Packet's sequence number is below `expected_seq` — a retransmission.
    Retransmission(TcpPacket),
}

#[derive(Default)]
pub struct Reorderer {
    expected_seq: Option<Seq32>,
    waiting: VecDeque<TcpPacket>,
}

impl Reorderer {
    pub fn new() -> Self {
        Reorderer::default()
    }

    pub fn expected_seq(&self) -> Option<Seq32> {
        self.expected_seq
    }

    pub fn push(&mut self, packet: TcpPacket) -> ReorderOutcome {
        if packet.tcp.is_syn() {
            self.waiting.clear();
            self.expected_seq = Some(packet.tcp.seq);
        }

        let Some(expected) = self.expected_seq else {
            self.expected_seq = Some(packet.tcp.seq);
            return self.insert_and_drain(packet);
        };

        if packet.tcp.seq.lt(expected) {
            return ReorderOutcome::Retransmission(packet);
        }

        self.insert_and_drain(packet)
    }

    fn insert_and_drain(&mut self, packet: TcpPacket) -> ReorderOutcome {
        if self.waiting.iter().any(|p| p.tcp.seq == packet.tcp.seq) {
            // Same seq already buffered — a duplicate, not a retransmission
            // with different segmentation. Kill it here rather than letting
            // it survive to the drain loop below, where it would eventually
            // look like a misaligned retransmission and clear the buffer.
            tracing::debug!("dropping duplicate-seq packet in reorder buffer");
            return ReorderOutcome::Buffered;
        }

        let idx = self
            .waiting
            .iter()
            .position(|p| packet.tcp.seq.lt(p.tcp.seq))
            .unwrap_or(self.waiting.len());
        self.waiting.insert(idx, packet);

        let mut ready = Vec::new();
        while let Some(front) = self.waiting.front() {
            let expected = self.expected_seq.expect("set above");
            if front.tcp.seq.lt(expected) {
                // A retransmission with a different segmentation arrived
                // after the gap it would have filled was already closed by
                // another packet — discard the now-misaligned tail.
                tracing::warn!("discarding misaligned retransmission in reorder buffer");
                self.waiting.clear();
                break;
            }
            if front.tcp.seq != expected {
                break;
            }
            let packet = self.waiting.pop_front().unwrap();
            self.expected_seq = Some(packet.next_seq());
            ready.push(packet);
        }

        if ready.is_empty() {
            ReorderOutcome::Buffered
        } else {
            ReorderOutcome::Ready(ready)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mbox_wire::headers::{Ipv4Header, TcpFlags, TcpHeader, TcpOptions, IP_PROTO_TCP};
    use std::net::Ipv4Addr;

    fn packet_at(seq: u32, payload: &'static [u8], flags: TcpFlags) -> TcpPacket {
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
                ack: Seq32::new(0),
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
    fn in_order_packets_pass_straight_through() {
        let mut r = Reorderer::new();
        matches!(r.push(packet_at(0, b"abc", TcpFlags::SYN)), ReorderOutcome::Ready(_));
        let outcome = r.push(packet_at(4, b"def", TcpFlags::ACK));
        assert!(matches!(outcome, ReorderOutcome::Ready(v) if v.len() == 1));
    }

    #[test]
    fn gap_buffers_until_filled() {
        let mut r = Reorderer::new();
        r.push(packet_at(0, b"", TcpFlags::SYN));
        let buffered = r.push(packet_at(10, b"later", TcpFlags::ACK));
        assert!(matches!(buffered, ReorderOutcome::Buffered));

        let ready = r.push(packet_at(1, b"123456789", TcpFlags::ACK));
        match ready {
            ReorderOutcome::Ready(v) => assert_eq!(v.len(), 2),
            _ => panic!("expected both packets released"),
        }
    }

    #[test]
    fn below_expected_is_retransmission() {
        let mut r = Reorderer::new();
        r.push(packet_at(0, b"hello", TcpFlags::SYN));
        let outcome = r.push(packet_at(0, b"hello", TcpFlags::ACK));
        assert!(matches!(outcome, ReorderOutcome::Retransmission(_)));
    }

    #[test]
    fn duplicate_seq_is_dropped_not_buffered_twice() {
        let mut r = Reorderer::new();
        r.push(packet_at(0, b"", TcpFlags::SYN));
        r.push(packet_at(10, b"later", TcpFlags::ACK));
        let outcome = r.push(packet_at(10, b"later", TcpFlags::ACK));
        assert!(matches!(outcome, ReorderOutcome::Buffered));

        // Filling the gap must still release exactly the one buffered
        // packet, not the clear()-everything misaligned-retransmission path
        // a surviving duplicate would otherwise trigger.
        let ready = r.push(packet_at(1, b"123456789", TcpFlags::ACK));
        match ready {
            ReorderOutcome::Ready(v) => assert_eq!(v.len(), 2),
            _ => panic!("expected both packets released"),
        }
    }

    #[test]
    fn syn_resets_and_flushes_waiting_list() {
        let mut r = Reorderer::new();
        r.push(packet_at(0, b"", TcpFlags::SYN));
        r.push(packet_at(100, b"stale", TcpFlags::ACK)); // buffered, far gap
        r.push(packet_at(0, b"", TcpFlags::SYN)); // new SYN, e.g. reused port
        assert_eq!(r.expected_seq(), Some(Seq32::new(1)));
    }
}
