//! The reframer's control loop, grounded on `elements/flow/sfmaker.cc`'s
//! `push_flow`/`run_task`: an ingress path that buffers or bypasses each
//! packet, and a drain path that walks the ready-list in priority order and
//! emits merged output batches.

use std::collections::HashMap;

use mbox_wire::{FiveTuple, TcpFlags, TcpPacket};
use quanta::Instant;
use slab::Slab;

use crate::config::{Prio, SfMakerConfig};
use crate::slot::SfSlot;

pub enum SfOutcome {
    /// Passed straight through without buffering.
    Bypass(TcpPacket),
    /// Queued in its flow's slot; nothing to emit yet.
    Buffered,
}

pub struct SfScheduler {
    cfg: SfMakerConfig,
    flows: HashMap<FiveTuple, usize>,
    arena: Slab<SfSlot>,
    head: Option<usize>,
    tail: Option<usize>,
    active_count: usize,
}

impl SfScheduler {
    pub fn new(cfg: SfMakerConfig) -> Self {
        SfScheduler {
            cfg,
            flows: HashMap::new(),
            arena: Slab::new(),
            head: None,
            tail: None,
            active_count: 0,
        }
    }

    pub fn config(&self) -> &SfMakerConfig {
        &self.cfg
    }

    fn link_tail(&mut self, idx: usize) {
        let slot = &mut self.arena[idx];
        if slot.in_list {
            return;
        }
        slot.in_list = true;
        slot.prev = self.tail;
        slot.next = None;
        match self.tail {
            Some(t) => self.arena[t].next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }

    fn link_head(&mut self, idx: usize) {
        let slot = &mut self.arena[idx];
        if slot.in_list {
            self.unlink(idx);
        }
        let slot = &mut self.arena[idx];
        slot.in_list = true;
        slot.next = self.head;
        slot.prev = None;
        match self.head {
            Some(h) => self.arena[h].prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let slot = &self.arena[idx];
            (slot.prev, slot.next)
        };
        match prev {
            Some(p) => self.arena[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.arena[n].prev = prev,
            None => self.tail = prev,
        }
        let slot = &mut self.arena[idx];
        slot.prev = None;
        slot.next = None;
        slot.in_list = false;
    }

    fn bypass_decision(&self, slot: Option<&SfSlot>, packet: &TcpPacket) -> bool {
        if self.cfg.bypass_syn && packet.tcp.is_syn() {
            return true;
        }
        match slot {
            None => false,
            Some(s) => s.is_empty() && s.fail >= self.cfg.bypass_after_fail,
        }
    }

    /// Ingress path. Mirrors `SFMaker::push_flow`.
    pub fn ingress(&mut self, packet: TcpPacket, now: Instant) -> SfOutcome {
        let ft = packet.five_tuple();
        let idx = *self.flows.entry(ft).or_insert_with(|| self.arena.insert(SfSlot::new(now)));

        if self.bypass_decision(Some(&self.arena[idx]), &packet) {
            return SfOutcome::Bypass(packet);
        }

        if let Some(max_cap) = self.cfg.max_cap {
            if self.active_count > max_cap {
                if let Some(h) = self.head {
                    self.arena[h].forced_flush = true;
                }
            }
        }

        let was_empty = self.arena[idx].is_empty();
        if was_empty {
            self.active_count += 1;
        }
        self.arena[idx].enqueue(now, packet);

        if was_empty {
            self.link_tail(idx);
        } else if self.arena[idx].batch.len() as u32 > self.cfg.max_burst {
            self.link_head(idx);
        }

        SfOutcome::Buffered
    }

    /// The earliest time any non-empty slot becomes ready, for arming the
    /// control-path timer.
    pub fn next_expiry(&self) -> Option<Instant> {
        if self.cfg.alwaysup {
            return None;
        }
        let mut earliest = None;
        let mut cur = self.head;
        while let Some(idx) = cur {
            let slot = &self.arena[idx];
            let exp = slot.expiry(&self.cfg);
            earliest = Some(match earliest {
                Some(e) if e < exp => e,
                _ => exp,
            });
            cur = slot.next;
        }
        earliest
    }

    /// Control path. Mirrors `SFMaker::run_task`: drain every ready slot
    /// into one priority-ordered output batch per call, bounded by
    /// `max_tx_burst` and optionally TCP-compressed.
    pub fn drain_ready(&mut self, now: Instant) -> Vec<Vec<TcpPacket>> {
        let mut ready: Vec<(i64, usize)> = Vec::new();
        let mut cur = self.head;
        while let Some(idx) = cur {
            let next = self.arena[idx].next;
            if self.arena[idx].ready(now, &self.cfg) {
                ready.push((self.arena[idx].prio(now, self.cfg.prio), idx));
            }
            cur = next;
        }
        ready.sort_by_key(|&(p, _)| p);

        let mut batches = Vec::new();
        let mut current = Vec::new();

        for (_, idx) in ready {
            self.unlink(idx);
            self.active_count = self.active_count.saturating_sub(1);
            let slot = &mut self.arena[idx];
            let mut packets = slot.dequeue_all();
            slot.forced_flush = false;
            slot.packet_sent += packets.len() as u64;
            slot.burst_sent += 1;
            if packets.len() == 1 {
                slot.fail += 1;
            } else {
                slot.fail = slot.fail.saturating_sub(1);
            }

            if self.cfg.reorder {
                packets.sort_by(|a, b| a.tcp.seq.cmp(&b.tcp.seq));
            }
            if self.cfg.proto_compress {
                compress_acks(&mut packets);
            }

            for packet in packets {
                current.push(packet);
                if current.len() as u32 >= self.cfg.max_tx_burst {
                    batches.push(std::mem::take(&mut current));
                }
            }
        }

        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }

    pub fn active_flow_count(&self) -> usize {
        self.active_count
    }
}

/// Within one output batch, drop redundant pure ACKs and propagate the
/// largest ACK number seen to every surviving packet, refreshing
/// checksums. Mirrors the `PROTO_COMPRESS` path in `sfmaker.cc`.
fn compress_acks(batch: &mut Vec<TcpPacket>) {
    let max_ack = batch.iter().map(|p| p.tcp.ack).max();
    let Some(max_ack) = max_ack else { return };

    batch.retain(|p| !p.is_just_an_ack());

    for packet in batch.iter_mut() {
        if packet.tcp.flags.contains(TcpFlags::ACK) && packet.tcp.ack != max_ack {
            packet.tcp.ack = max_ack;
            let (src, dst) = (packet.ip.src, packet.ip.dst);
            let payload = packet.payload.clone();
            packet.tcp.fix_checksum(src, dst, &payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mbox_wire::headers::{Ipv4Header, TcpFlags, TcpHeader, TcpOptions, IP_PROTO_TCP};
    use mbox_wire::Seq32;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn packet_at(seq: u32, flags: TcpFlags) -> TcpPacket {
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
            payload: Bytes::from_static(b"x"),
            annotations: Default::default(),
        }
    }

    #[test]
    fn burst_exceeding_max_burst_triggers_immediate_readiness() {
        let mut cfg = SfMakerConfig::default();
        cfg.max_burst = 3;
        cfg.delay_us = 1_000_000;
        let mut sched = SfScheduler::new(cfg);
        let now = Instant::now();

        for seq in 0..4 {
            sched.ingress(packet_at(seq, TcpFlags::ACK), now);
        }

        let batches = sched.drain_ready(now);
        assert_eq!(batches.into_iter().flatten().count(), 4);
    }

    #[test]
    fn slot_not_ready_before_expiry() {
        let mut cfg = SfMakerConfig::default();
        cfg.delay_us = 100;
        cfg.max_burst = 100;
        let mut sched = SfScheduler::new(cfg);
        let now = Instant::now();
        sched.ingress(packet_at(0, TcpFlags::ACK), now);

        let batches = sched.drain_ready(now);
        assert!(batches.is_empty());

        let later = now + Duration::from_micros(200);
        let batches = sched.drain_ready(later);
        assert_eq!(batches.into_iter().flatten().count(), 1);
    }

    #[test]
    fn bypass_syn_when_configured() {
        let mut cfg = SfMakerConfig::default();
        cfg.bypass_syn = true;
        let mut sched = SfScheduler::new(cfg);
        let now = Instant::now();
        match sched.ingress(packet_at(0, TcpFlags::SYN), now) {
            SfOutcome::Bypass(_) => {}
            SfOutcome::Buffered => panic!("expected bypass"),
        }
    }
}
