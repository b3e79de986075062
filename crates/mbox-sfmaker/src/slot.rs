//! Per-flow reframing state, grounded on `elements/flow/sfmaker.hh`'s
//! `SFSlot`. The original's hand-rolled intrusive list (`SFSlot::next/prev`
//! pointers into a per-thread flow vector) becomes `prev`/`next` indices
//! into the scheduler's [`slab::Slab`] (spec §9 redesign note).

use std::collections::VecDeque;
use std::time::Duration;

use mbox_wire::TcpPacket;
use quanta::Instant;

use crate::config::{Model, Prio, SfMakerConfig};

pub struct SfSlot {
    pub first_seen: Instant,
    pub waiting_since: Option<Instant>,
    pub last_seen: Option<Instant>,
    pub batch: VecDeque<TcpPacket>,
    pub burst_sent: u32,
    pub forced_flush: bool,
    pub packet_sent: u64,
    pub fail: u32,
    pub prev: Option<usize>,
    pub next: Option<usize>,
    pub in_list: bool,
}

impl SfSlot {
    pub fn new(now: Instant) -> Self {
        SfSlot {
            first_seen: now,
            waiting_since: None,
            last_seen: None,
            batch: VecDeque::new(),
            burst_sent: 0,
            forced_flush: false,
            packet_sent: 0,
            fail: 0,
            prev: None,
            next: None,
            in_list: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub fn enqueue(&mut self, now: Instant, packet: TcpPacket) {
        if self.batch.is_empty() {
            self.waiting_since = Some(now);
        }
        self.last_seen = Some(now);
        self.batch.push_back(packet);
    }

    pub fn dequeue_all(&mut self) -> Vec<TcpPacket> {
        self.batch.drain(..).collect()
    }

    /// Scheduling weight — lower drains first. Mirrors `SFSlot::prio`.
    pub fn prio(&self, now: Instant, prio: Prio) -> i64 {
        match prio {
            Prio::FirstSeen => now.saturating_duration_since(self.first_seen).as_micros() as i64,
            Prio::Sent => -(self.packet_sent as i64),
            Prio::Delay => {
                let since = self.waiting_since.unwrap_or(now);
                now.saturating_duration_since(since).as_micros() as i64
            }
        }
    }

    /// Is this slot ready to drain right now? Mirrors `SFSlot::ready`.
    pub fn ready(&self, now: Instant, cfg: &SfMakerConfig) -> bool {
        if self.is_empty() {
            return false;
        }
        if self.batch.len() as u32 > cfg.max_burst {
            return true;
        }
        if self.forced_flush {
            return true;
        }
        if cfg.model == Model::Second && self.packet_sent == 0 {
            return true;
        }
        now >= self.expiry(cfg)
    }

    /// Mirrors `SFSlot::expiry`: `waiting_since + DELAY`, clamped into
    /// `[last_seen + DELAY_LAST, waiting_since + DELAY_HARD]`.
    pub fn expiry(&self, cfg: &SfMakerConfig) -> Instant {
        let waiting_since = self.waiting_since.unwrap_or(self.first_seen);
        let last_seen = self.last_seen.unwrap_or(waiting_since);
        let target = waiting_since + Duration::from_micros(cfg.delay_us);
        let lower = last_seen + Duration::from_micros(cfg.delay_last_us);
        let upper = waiting_since + Duration::from_micros(cfg.delay_hard_us);
        target.max(lower).min(upper)
    }
}
