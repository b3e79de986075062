//! # Byte-stream maintainer
//!
//! Tracks, per direction of a TCP connection, every insertion/deletion the
//! middlebox has made to the byte stream so that sequence and ack numbers
//! can be translated between "as originally sent" and "as sent on the wire".
//!
//! Two ordered maps (`ack` and `seq`) hold `position -> offset` modification
//! points. `offset` is positive when bytes were inserted before `position`
//! and negative when bytes were removed. Both maps are keyed with [`Seq32`]
//! so lookups respect wraparound — this is only a valid total order for
//! positions clustered within one connection's active window, same caveat
//! as the type itself.

use std::collections::BTreeMap;

use mbox_wire::Seq32;

/// Every `PRUNE_THRESHOLD` acks, old modification entries below the
/// acknowledged position are dropped so the maps don't grow unbounded.
pub const PRUNE_THRESHOLD: u32 = 50;

const DEFAULT_WINDOW_SIZE: u16 = 32120;
const DEFAULT_MSS: u16 = 536;
const DEFAULT_SSTHRESH: u64 = 65535;

#[derive(Debug)]
pub struct ByteStreamMaintainer {
    ack_tree: BTreeMap<Seq32, i32>,
    seq_tree: BTreeMap<Seq32, i32>,
    prune_counter: u32,
    initialized: bool,

    last_ack_sent: Option<Seq32>,
    last_seq_sent: Option<Seq32>,
    last_ack_received: Option<Seq32>,
    last_payload_length: u16,

    window_size: u16,
    window_scale: u16,
    use_window_scale: bool,
    dup_acks: u8,

    congestion_window: u64,
    ssthresh: u64,
    mss: u16,

    ip_src: std::net::Ipv4Addr,
    ip_dst: std::net::Ipv4Addr,
    port_src: u16,
    port_dst: u16,
}

impl Default for ByteStreamMaintainer {
    fn default() -> Self {
        ByteStreamMaintainer {
            ack_tree: BTreeMap::new(),
            seq_tree: BTreeMap::new(),
            prune_counter: 0,
            initialized: false,
            last_ack_sent: None,
            last_seq_sent: None,
            last_ack_received: None,
            last_payload_length: 0,
            window_size: DEFAULT_WINDOW_SIZE,
            window_scale: 1,
            use_window_scale: false,
            dup_acks: 0,
            congestion_window: DEFAULT_MSS as u64,
            ssthresh: DEFAULT_SSTHRESH,
            mss: DEFAULT_MSS,
            ip_src: std::net::Ipv4Addr::UNSPECIFIED,
            ip_dst: std::net::Ipv4Addr::UNSPECIFIED,
            port_src: 0,
            port_dst: 0,
        }
    }
}

impl ByteStreamMaintainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset to a freshly constructed state, keyed to `flow_start` as the
    /// initial guard entry in both trees.
    pub fn initialize(&mut self, flow_start: Seq32) {
        if self.initialized {
            tracing::warn!("ByteStreamMaintainer already initialized");
            return;
        }
        self.ack_tree.insert(flow_start, 0);
        self.seq_tree.insert(flow_start, 0);
        self.initialized = true;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Record an insertion (`offset > 0`) or deletion (`offset < 0`) of bytes
    /// at `position`, as observed on the ack side of this direction.
    pub fn insert_in_ack_tree(&mut self, position: Seq32, offset: i32) {
        self.insert_in_tree_ack(position, offset);
    }

    pub fn insert_in_seq_tree(&mut self, position: Seq32, offset: i32) {
        self.insert_in_tree_seq(position, offset);
    }

    fn insert_in_tree_ack(&mut self, position: Seq32, offset: i32) {
        if !self.initialized {
            tracing::error!("ByteStreamMaintainer is not initialized");
            return;
        }
        self.ack_tree.insert(position, offset);
    }

    fn insert_in_tree_seq(&mut self, position: Seq32, offset: i32) {
        if !self.initialized {
            tracing::error!("ByteStreamMaintainer is not initialized");
            return;
        }
        self.seq_tree.insert(position, offset);
    }

    /// Map an ack number through the recorded modifications, clamped between
    /// the bounds implied by the modification's predecessor and successor.
    pub fn map_ack(&self, position: Seq32) -> Seq32 {
        if !self.initialized {
            tracing::error!("ByteStreamMaintainer is not initialized");
            return position;
        }

        let Some((&node_key, &node_offset)) = greatest_leq(&self.ack_tree, position) else {
            return position;
        };

        let mut new_position = apply_offset(position, node_offset);

        let pred_offset = predecessor(&self.ack_tree, node_key)
            .map(|(_, &o)| o)
            .unwrap_or(0);
        let pred_bound = apply_offset(node_key, pred_offset);
        if new_position.lt(pred_bound) {
            new_position = pred_bound;
        }

        if let Some((&succ_key, &succ_offset)) = successor(&self.ack_tree, node_key) {
            if succ_offset > 0 {
                let succ_bound = apply_offset(succ_key, succ_offset);
                if new_position.gt(succ_bound) {
                    new_position = succ_bound;
                }
            }
        }

        new_position
    }

    /// Map a sequence number. Unlike `map_ack`, the lookup key is
    /// `position - 1` so a modification recorded at the packet's own
    /// sequence number does not apply to itself — see the worked example in
    /// the original implementation this is grounded on.
    pub fn map_seq(&self, position: Seq32) -> Seq32 {
        if !self.initialized {
            tracing::error!("ByteStreamMaintainer is not initialized");
            return position;
        }

        let seek = position.sub(1);
        let Some((&node_key, &node_offset)) = greatest_leq(&self.seq_tree, seek) else {
            return position;
        };

        let mut new_position = apply_offset(position, node_offset);

        let pred_offset = predecessor(&self.seq_tree, node_key)
            .map(|(_, &o)| o)
            .unwrap_or(0);
        let pred_bound = apply_offset(node_key, pred_offset);
        if new_position.lt(pred_bound) {
            new_position = pred_bound;
        }

        new_position
    }

    /// The offset carried by the modification with the greatest key in the
    /// ack tree, or 0 if the tree only has its guard entry.
    pub fn last_offset_in_ack_tree(&self) -> i32 {
        self.ack_tree.values().next_back().copied().unwrap_or(0)
    }

    /// Drop modification entries below `position` once `PRUNE_THRESHOLD`
    /// acks have accumulated since the last prune.
    pub fn prune(&mut self, position: Seq32) {
        if !self.initialized {
            tracing::error!("ByteStreamMaintainer is not initialized");
            return;
        }
        self.prune_counter += 1;
        if self.prune_counter < PRUNE_THRESHOLD {
            return;
        }
        self.prune_counter = 0;

        retain_geq(&mut self.ack_tree, position);
        let position_seq = self.map_ack(position);
        retain_geq(&mut self.seq_tree, position_seq);
    }

    // ─── Accessors ───────────────────────────────────────────────────────

    pub fn set_last_ack_sent(&mut self, ack: Seq32) {
        self.last_ack_sent = Some(match self.last_ack_sent {
            Some(prev) if ack.leq(prev) => prev,
            _ => ack,
        });
    }
    pub fn last_ack_sent(&self) -> Option<Seq32> {
        self.last_ack_sent
    }

    pub fn set_last_seq_sent(&mut self, seq: Seq32) {
        self.last_seq_sent = Some(match self.last_seq_sent {
            Some(prev) if seq.leq(prev) => prev,
            _ => seq,
        });
    }
    pub fn last_seq_sent(&self) -> Option<Seq32> {
        self.last_seq_sent
    }

    pub fn set_last_ack_received(&mut self, ack: Seq32) {
        self.last_ack_received = Some(match self.last_ack_received {
            Some(prev) if ack.leq(prev) => prev,
            _ => ack,
        });
    }
    pub fn last_ack_received(&self) -> Option<Seq32> {
        self.last_ack_received
    }

    pub fn set_last_payload_length(&mut self, len: u16) {
        self.last_payload_length = len;
    }
    pub fn last_payload_length(&self) -> u16 {
        self.last_payload_length
    }

    pub fn dup_acks(&self) -> u8 {
        self.dup_acks
    }
    pub fn set_dup_acks(&mut self, n: u8) {
        self.dup_acks = n;
    }

    pub fn window_size(&self) -> u16 {
        self.window_size
    }
    pub fn set_window_size(&mut self, w: u16) {
        self.window_size = w;
    }

    pub fn window_scale(&self) -> u16 {
        self.window_scale
    }
    pub fn set_window_scale(&mut self, s: u16) {
        self.window_scale = s;
    }

    pub fn use_window_scale(&self) -> bool {
        self.use_window_scale
    }
    pub fn set_use_window_scale(&mut self, v: bool) {
        self.use_window_scale = v;
    }

    pub fn mss(&self) -> u16 {
        self.mss
    }
    pub fn set_mss(&mut self, mss: u16) {
        self.mss = mss;
    }

    pub fn congestion_window(&self) -> u64 {
        self.congestion_window
    }
    pub fn set_congestion_window(&mut self, cwnd: u64) {
        self.congestion_window = cwnd;
    }

    pub fn ssthresh(&self) -> u64 {
        self.ssthresh
    }
    pub fn set_ssthresh(&mut self, ssthresh: u64) {
        self.ssthresh = ssthresh;
    }

    pub fn set_five_tuple(&mut self, src: std::net::Ipv4Addr, sport: u16, dst: std::net::Ipv4Addr, dport: u16) {
        self.ip_src = src;
        self.port_src = sport;
        self.ip_dst = dst;
        self.port_dst = dport;
    }
    pub fn ip_src(&self) -> std::net::Ipv4Addr {
        self.ip_src
    }
    pub fn ip_dst(&self) -> std::net::Ipv4Addr {
        self.ip_dst
    }
    pub fn port_src(&self) -> u16 {
        self.port_src
    }
    pub fn port_dst(&self) -> u16 {
        self.port_dst
    }
}

/// Apply a signed modification offset to a sequence number, wrapping at 2^32.
fn apply_offset(position: Seq32, offset: i32) -> Seq32 {
    Seq32::new(position.value().wrapping_add(offset as u32))
}

fn greatest_leq(tree: &BTreeMap<Seq32, i32>, key: Seq32) -> Option<(&Seq32, &i32)> {
    tree.range(..=key).next_back()
}

fn predecessor(tree: &BTreeMap<Seq32, i32>, key: Seq32) -> Option<(&Seq32, &i32)> {
    tree.range(..key).next_back()
}

fn successor(tree: &BTreeMap<Seq32, i32>, key: Seq32) -> Option<(&Seq32, &i32)> {
    tree.range(key.add(1)..).next()
}

fn retain_geq(tree: &mut BTreeMap<Seq32, i32>, position: Seq32) {
    tree.retain(|&k, _| k.geq(position));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uninitialized_map_is_identity() {
        let m = ByteStreamMaintainer::new();
        assert_eq!(m.map_ack(Seq32::new(100)), Seq32::new(100));
        assert_eq!(m.map_seq(Seq32::new(100)), Seq32::new(100));
    }

    #[test]
    fn map_ack_reflects_single_insertion() {
        let mut m = ByteStreamMaintainer::new();
        m.initialize(Seq32::new(0));
        // 5 bytes inserted at position 100: everything from there on shifts +5.
        m.insert_in_ack_tree(Seq32::new(100), 5);
        assert_eq!(m.map_ack(Seq32::new(50)), Seq32::new(50));
        assert_eq!(m.map_ack(Seq32::new(150)), Seq32::new(155));
    }

    #[test]
    fn map_seq_excludes_modification_at_packet_start() {
        let mut m = ByteStreamMaintainer::new();
        m.initialize(Seq32::new(0));
        // Bytes added starting at seq 6 (see module doc): a retransmission of
        // the packet that begins exactly at 6 must not see its own insertion.
        m.insert_in_seq_tree(Seq32::new(6), 3);
        assert_eq!(m.map_seq(Seq32::new(6)), Seq32::new(6));
        assert_eq!(m.map_seq(Seq32::new(7)), Seq32::new(10));
    }

    #[test]
    fn prune_drops_old_entries_after_threshold() {
        let mut m = ByteStreamMaintainer::new();
        m.initialize(Seq32::new(0));
        m.insert_in_ack_tree(Seq32::new(10), 2);
        m.insert_in_seq_tree(Seq32::new(10), 2);
        for _ in 0..PRUNE_THRESHOLD {
            m.prune(Seq32::new(20));
        }
        assert!(m.ack_tree.keys().all(|k| k.geq(Seq32::new(20))));
    }

    #[test]
    fn last_ack_sent_never_regresses_under_wraparound() {
        let mut m = ByteStreamMaintainer::new();
        m.set_last_ack_sent(Seq32::new(u32::MAX - 2));
        m.set_last_ack_sent(Seq32::new(1)); // wrapped forward, must win
        assert_eq!(m.last_ack_sent(), Some(Seq32::new(1)));
    }
}
