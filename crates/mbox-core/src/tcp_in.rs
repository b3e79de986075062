//! # TCPIn — ingress half of a TCP direction
//!
//! The first stop for every packet on a flow: completes the handshake
//! bookkeeping, enforces the closing-state machine, catches content the
//! peer already has ACKed (the ACK must have been lost), maps an incoming
//! ACK through the *other* direction's maintainer, runs the congestion
//! window update and duplicate-ACK / fast-retransmit detection, and hands
//! the (possibly ACK-rewritten) packet on. Grounded on
//! `elements/middlebox/tcpin.cc`'s `TCPIn::processPacket`.

use mbox_wire::{Seq32, TcpFlags, TcpPacket};

use crate::closing::ClosingState;
use crate::fcb::{Direction, TcpConnection};
use crate::synthetic;

/// Three duplicate ACKs in a row trigger a fast retransmit.
const DUP_ACK_FAST_RETRANSMIT_THRESHOLD: u8 = 3;

pub enum TcpInOutcome {
    /// Continue processing this packet downstream.
    Forward(TcpPacket),
    /// No payload continues downstream; send this forged ACK instead.
    Ack(TcpPacket),
    /// Drop silently — the packet carries no information worth acting on.
    Drop,
}

pub struct TcpIn {
    direction: Direction,
}

impl TcpIn {
    pub fn new(direction: Direction) -> Self {
        TcpIn { direction }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Run a packet through this direction's ingress logic against the
    /// shared connection state. `now` is used to fold RTT samples into the
    /// opposite direction's retransmission timing.
    pub fn process(
        &self,
        conn: &mut TcpConnection,
        mut packet: TcpPacket,
        now: quanta::Instant,
    ) -> TcpInOutcome {
        let dir = self.direction;
        let other = dir.opposite();

        if !conn.maintainer(dir).is_initialized() {
            if !packet.tcp.is_syn() {
                tracing::warn!("dropping packet seen before a SYN established this direction");
                return TcpInOutcome::Drop;
            }
            let ft = packet.five_tuple();
            let maintainer = conn.maintainer_mut(dir);
            maintainer.initialize(packet.tcp.seq);
            maintainer.set_five_tuple(ft.src_ip, ft.src_port, ft.dst_ip, ft.dst_port);
        } else if packet.tcp.is_syn() {
            tracing::warn!("unexpected SYN after the handshake completed, dropping");
            return TcpInOutcome::Drop;
        }

        match conn.closing_state(dir) {
            ClosingState::Open => {}
            ClosingState::BeingClosedGraceful | ClosingState::ClosedGraceful => {
                if packet.tcp.is_fin() || packet.tcp.is_syn() || packet.payload_len() > 0 {
                    return match self.build_ack(conn, &packet, true) {
                        Some(ack) => TcpInOutcome::Ack(ack),
                        None => TcpInOutcome::Drop,
                    };
                }
                return TcpInOutcome::Drop;
            }
            ClosingState::BeingClosedUngraceful | ClosingState::ClosedUngraceful => {
                return TcpInOutcome::Drop;
            }
        }

        packet.annotations.init_ack = packet.tcp.ack.value();

        manage_options(conn, dir, &packet);

        let prev_window = conn.maintainer(dir).window_size();
        conn.maintainer_mut(dir).set_window_size(packet.tcp.window);

        let seq_number = packet.tcp.seq;
        if let Some(last_ack_sent_other) = conn.maintainer(other).last_ack_sent() {
            if !packet.tcp.is_syn() && seq_number.lt(last_ack_sent_other) {
                // Content we (on the other side) already ACKed arrived again
                // — the ACK must have been lost between us and the real
                // destination. Re-ACK it and discard.
                return match self.build_ack(conn, &packet, false) {
                    Some(ack) => TcpInOutcome::Ack(ack),
                    None => TcpInOutcome::Drop,
                };
            }
        }

        if packet.tcp.is_ack() {
            let ack_number = packet.tcp.ack;
            let new_ack_number = conn.maintainer(other).map_ack(ack_number);
            let prev_last_ack_received = conn.maintainer(dir).last_ack_received();

            if let Some(prev) = prev_last_ack_received {
                if ack_number.gt(prev) {
                    grow_congestion_window(conn, other);
                    conn.maintainer_mut(dir).set_dup_acks(0);
                }
            }

            conn.maintainer_mut(dir).set_last_ack_received(ack_number);
            conn.maintainer_mut(other).prune(ack_number);

            conn.retransmit[other.index()].signal_ack(ack_number, now);

            if packet.is_just_an_ack() && prev_window == packet.tcp.window {
                let mut is_dup = false;

                if prev_last_ack_received == Some(ack_number) {
                    is_dup = true;
                    let dups = conn.maintainer(dir).dup_acks() + 1;
                    conn.maintainer_mut(dir).set_dup_acks(dups);

                    if dups >= DUP_ACK_FAST_RETRANSMIT_THRESHOLD {
                        conn.retransmit[other.index()].fire_now();
                        conn.maintainer_mut(dir).set_dup_acks(0);
                    }
                }

                // An ACK that brings nothing new can still be a duplicate
                // ACK we must forward for fast-retransmit to work on the far
                // end; only drop it once it's neither new nor a dup.
                if let Some(last_sent) = conn.maintainer(dir).last_ack_sent() {
                    if new_ack_number.leq(last_sent) && !is_dup {
                        return TcpInOutcome::Drop;
                    }
                }
            }

            if ack_number != new_ack_number {
                packet.tcp.ack = new_ack_number;
            }
        }

        TcpInOutcome::Forward(packet)
    }

    /// Re-ACK `packet`'s sender on behalf of the opposite direction: seq is
    /// the initial ACK value this packet carried in, ack is the sequence
    /// number just past this packet's payload (and SYN/FIN, if set).
    fn build_ack(&self, conn: &mut TcpConnection, packet: &TcpPacket, force: bool) -> Option<TcpPacket> {
        let ft = packet.five_tuple();
        let seq = Seq32::new(packet.annotations.init_ack);
        let mut ack = packet.tcp.seq.add(packet.payload_len());
        if packet.tcp.is_fin() || packet.tcp.is_syn() {
            ack = ack.add(1);
        }

        let maintainer = conn.maintainer_mut(self.direction.opposite());
        synthetic::send_ack(
            maintainer,
            ft.dst_ip,
            ft.src_ip,
            ft.dst_port,
            ft.src_port,
            seq,
            ack,
            force,
        )
    }
}

/// SYN packets carry the options that configure a direction: strip
/// SACK-permitted, detect window scaling, detect MSS and seed the
/// congestion window from it. Grounded on `TCPIn::manageOptions`.
fn manage_options(conn: &mut TcpConnection, dir: Direction, packet: &TcpPacket) {
    if !packet.tcp.is_syn() {
        return;
    }
    let opts = &packet.tcp.options;

    if let Some(shift) = opts.window_scale {
        let mut window_scale = shift as u16;
        if window_scale >= 1 {
            window_scale = 2u16 << (window_scale - 1);
        }
        conn.maintainer_mut(dir).set_window_scale(window_scale);
        conn.maintainer_mut(dir).set_use_window_scale(true);

        if packet.tcp.is_ack() {
            // SYN-ACK: we now know whether the other side offered window
            // scaling too. If it didn't, disable it here as well.
            if !conn.maintainer(dir.opposite()).use_window_scale() {
                conn.maintainer_mut(dir).set_use_window_scale(false);
            }
        }
    }

    if let Some(mss) = opts.mss {
        conn.maintainer_mut(dir).set_mss(mss);
        conn.maintainer_mut(dir).set_congestion_window(mss as u64);
    }
}

/// Slow-start additive increase below `ssthresh`, AIMD congestion-avoidance
/// increase above it. Applied to the *other* direction's maintainer because
/// its congestion window governs how much unacknowledged data the
/// retransmission buffer on that side may hold.
fn grow_congestion_window(conn: &mut TcpConnection, other: Direction) {
    let cwnd = conn.maintainer(other).congestion_window();
    let ssthresh = conn.maintainer(other).ssthresh();
    let mss = conn.maintainer(other).mss() as u64;

    let increase = if cwnd <= ssthresh {
        mss
    } else {
        mss * mss / cwnd.max(1)
    };

    conn.maintainer_mut(other).set_congestion_window(cwnd + increase);
}

/// Locally initiate closing this flow — set this side's flags on `packet`
/// (FIN or RST) and, if `both_sides`, mark the other direction closed too
/// and forge the segment that finishes its side. Grounded on
/// `TCPIn::closeConnection`.
pub fn close_connection(
    conn: &mut TcpConnection,
    direction: Direction,
    packet: &mut TcpPacket,
    graceful: bool,
    both_sides: bool,
) -> Option<TcpPacket> {
    let new_flag = if graceful { TcpFlags::FIN } else { TcpFlags::RST };
    packet.tcp.flags.insert(new_flag);

    let (self_state, other_state) = if graceful {
        (ClosingState::BeingClosedGraceful, ClosingState::ClosedGraceful)
    } else {
        (ClosingState::BeingClosedUngraceful, ClosingState::ClosedUngraceful)
    };
    conn.set_closing_state(direction, self_state);

    let mut closing_segment = None;
    if both_sides {
        conn.set_closing_state(direction.opposite(), other_state);

        let ft = packet.five_tuple();
        let seq = Seq32::new(packet.annotations.init_ack);
        let mut ack = packet.tcp.seq.add(packet.payload_len());
        if packet.tcp.is_fin() || packet.tcp.is_syn() {
            ack = ack.add(1);
        }

        let maintainer = conn.maintainer_mut(direction.opposite());
        closing_segment = Some(synthetic::send_closing_packet(
            maintainer,
            ft.dst_ip,
            ft.src_ip,
            ft.dst_port,
            ft.src_port,
            seq,
            ack,
            graceful,
        ));
    }

    tracing::info!(direction = direction.index(), graceful, both_sides, "closing connection");
    closing_segment
}
