//! Per-queue worker: the thread that actually runs packets through the TCP
//! core and the reframer. One of these owns one shard of the flow table, so
//! a flow's two directions must always land on the same queue (the caller
//! picks a queue by hashing the flow's unordered five-tuple key before
//! calling [`QueueHandle::try_send`]).
//!
//! Modeled on `strata-bonding::runtime::BondingRuntime`: a bounded
//! `crossbeam_channel` feeds a dedicated `std::thread`, `recv_timeout` drives
//! both message handling and periodic housekeeping, and dropping the handle
//! shuts the thread down gracefully. Unlike the teacher's async control
//! plane, there is intentionally no tokio runtime anywhere in this crate —
//! every "wait" here is a synchronous timer reschedule, matching the
//! middlebox's own non-async event-loop shape.

use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use mbox_core::{ConnectionTable, Direction, TcpIn, TcpInOutcome, TcpOut, TcpRetransmitter};
use mbox_sfmaker::{SfMakerConfig, SfOutcome, SfScheduler};
use mbox_wire::TcpPacket;

/// Where a queue's finished batches go. Deliberately NIC-agnostic — wiring
/// an `AF_PACKET`/`netmap`/DPDK TX ring behind this trait is host-specific
/// and out of scope here (see the crate's NIC I/O non-goal in `SPEC_FULL.md`).
pub trait PacketSink: Send {
    fn send(&mut self, packet: TcpPacket);
}

/// Forwards every packet onto a channel, dropping it if the receiver is
/// gone or full rather than blocking the worker thread.
pub struct ChannelSink(pub Sender<TcpPacket>);

impl PacketSink for ChannelSink {
    fn send(&mut self, packet: TcpPacket) {
        if self.0.try_send(packet).is_err() {
            tracing::debug!("output channel full or closed, dropping packet");
        }
    }
}

/// A sink with nowhere to send to. Used where a worker must be wired up
/// before its output destination (a real NIC TX ring) exists.
pub struct NullSink;

impl PacketSink for NullSink {
    fn send(&mut self, _packet: TcpPacket) {}
}

enum WorkerMessage {
    Packet(TcpPacket),
    Shutdown,
}

#[derive(Debug)]
pub enum SendError {
    Full,
    Disconnected,
}

/// Handle to a running worker thread. Dropping it shuts the worker down.
pub struct QueueHandle {
    sender: Sender<WorkerMessage>,
    handle: Option<thread::JoinHandle<()>>,
}

impl QueueHandle {
    pub fn try_send(&self, packet: TcpPacket) -> Result<(), SendError> {
        match self.sender.try_send(WorkerMessage::Packet(packet)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SendError::Full),
            Err(TrySendError::Disconnected(_)) => Err(SendError::Disconnected),
        }
    }

    pub fn shutdown(&mut self) {
        let _ = self.sender.send(WorkerMessage::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for QueueHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawn one worker thread with its own flow table and reframer.
pub fn spawn_queue<S>(
    name: impl Into<String>,
    channel_capacity: usize,
    sfmaker_cfg: SfMakerConfig,
    sink: S,
) -> QueueHandle
where
    S: PacketSink + 'static,
{
    let (tx, rx) = bounded(channel_capacity);
    let name = name.into();
    let handle = thread::Builder::new()
        .name(name.clone())
        .spawn(move || worker_loop(rx, sfmaker_cfg, sink))
        .unwrap_or_else(|e| panic!("failed to spawn worker thread {name}: {e}"));

    QueueHandle { sender: tx, handle: Some(handle) }
}

const DRAIN_INTERVAL: Duration = Duration::from_micros(50);
const RECV_POLL: Duration = Duration::from_micros(200);
const RTO_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

fn worker_loop(rx: Receiver<WorkerMessage>, sfmaker_cfg: SfMakerConfig, mut sink: impl PacketSink) {
    let mut flows = ConnectionTable::new();
    let mut sf = SfScheduler::new(sfmaker_cfg);
    let mut last_drain = quanta::Instant::now();
    let mut last_rto_sweep = quanta::Instant::now();

    loop {
        match rx.recv_timeout(RECV_POLL) {
            Ok(WorkerMessage::Packet(packet)) => {
                let now = quanta::Instant::now();
                for immediate in handle_packet(&mut flows, &mut sf, packet, now) {
                    sink.send(immediate);
                }
            }
            Ok(WorkerMessage::Shutdown) => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let now = quanta::Instant::now();
        if now.saturating_duration_since(last_drain) >= DRAIN_INTERVAL {
            drain_ready(&mut sf, now, &mut sink);
            last_drain = now;
        }
        if now.saturating_duration_since(last_rto_sweep) >= RTO_SWEEP_INTERVAL {
            sweep_rto_timers(&flows, now, &mut sink);
            last_rto_sweep = now;
        }
    }

    drain_ready(&mut sf, quanta::Instant::now(), &mut sink);
    tracing::info!(flows = flows.len(), "worker thread shutting down");
}

/// Walk every live flow's two directions and resend anything whose RTO has
/// elapsed since the last sweep. Unlike a reactive dup-ACK fast retransmit,
/// this is the only path that drives a genuine timeout-triggered resend —
/// nothing about receiving a packet ever calls it.
fn sweep_rto_timers(flows: &ConnectionTable, now: quanta::Instant, sink: &mut impl PacketSink) {
    for shared in flows.iter() {
        let mut conn = shared.lock().unwrap_or_else(|e| e.into_inner());
        for dir in [Direction::Forward, Direction::Reverse] {
            if let Some(packet) = TcpRetransmitter::new(dir).poll_timer(&mut conn, now) {
                sink.send(packet);
            }
        }
    }
}

fn drain_ready(sf: &mut SfScheduler, now: quanta::Instant, sink: &mut impl PacketSink) {
    for batch in sf.drain_ready(now) {
        for packet in batch {
            sink.send(packet);
        }
    }
}

/// Feed `packet` to the reframer; a bypassed packet (SYN, or a flow that has
/// failed too many times) is returned for immediate sending instead of being
/// buffered.
fn feed(sf: &mut SfScheduler, packet: TcpPacket, now: quanta::Instant, immediate: &mut Vec<TcpPacket>) {
    match sf.ingress(packet, now) {
        SfOutcome::Bypass(packet) => immediate.push(packet),
        SfOutcome::Buffered => {}
    }
}

/// Run one packet through the ingress/egress/retransmitter chain for its
/// flow, returning whatever must go out immediately (the reframer may still
/// be holding everything else for a later batch).
///
/// No [`mbox_core::modlist::ModificationList`] is threaded through `TcpOut`
/// here — there is no content-rewriting element downstream in this
/// workspace, so every packet's payload passes through unmodified (the
/// HTTP/insult-remover rewriter layer is out of scope; see `SPEC_FULL.md`'s
/// Non-goals).
fn handle_packet(
    flows: &mut ConnectionTable,
    sf: &mut SfScheduler,
    packet: TcpPacket,
    now: quanta::Instant,
) -> Vec<TcpPacket> {
    let mut immediate = Vec::new();
    let ft = packet.five_tuple();
    let shared = flows.get_or_insert(ft);
    let mut conn = shared.lock().unwrap_or_else(|e| e.into_inner());

    let dir = if ft == conn.five_tuple { Direction::Forward } else { Direction::Reverse };

    let tcp_in = TcpIn::new(dir);
    let forwarded = match tcp_in.process(&mut conn, packet, now) {
        TcpInOutcome::Forward(pkt) => pkt,
        TcpInOutcome::Ack(ack) => {
            feed(sf, ack, now, &mut immediate);
            return finish(flows, ft, conn, immediate);
        }
        TcpInOutcome::Drop => return finish(flows, ft, conn, immediate),
    };

    let payload_len_before = forwarded.payload_len();
    let tcp_out = TcpOut::new(dir);
    let out = tcp_out.process(&mut conn, forwarded, None, payload_len_before);

    if let Some(ack) = out.synthetic_ack {
        feed(sf, ack, now, &mut immediate);
    }
    if let Some(primary) = out.primary {
        let retransmitter = TcpRetransmitter::new(dir);
        if let Some(buffered) = retransmitter.process_normal(&mut conn, primary, now) {
            feed(sf, buffered, now, &mut immediate);
        }
    }

    finish(flows, ft, conn, immediate)
}

fn finish(
    flows: &mut ConnectionTable,
    ft: mbox_wire::FiveTuple,
    conn: std::sync::MutexGuard<'_, mbox_core::TcpConnection>,
    immediate: Vec<TcpPacket>,
) -> Vec<TcpPacket> {
    let fully_closed = conn.is_fully_closed();
    drop(conn);
    if fully_closed {
        flows.remove(ft);
    }
    immediate
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mbox_wire::headers::{Ipv4Header, TcpFlags, TcpHeader, TcpOptions, IP_PROTO_TCP};
    use mbox_wire::Seq32;
    use std::net::Ipv4Addr;

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
    fn syn_bypasses_the_reframer_immediately() {
        let mut flows = ConnectionTable::new();
        let mut sf = SfScheduler::new(SfMakerConfig { bypass_syn: true, ..Default::default() });
        let now = quanta::Instant::now();

        let immediate = handle_packet(&mut flows, &mut sf, packet_at(0, 0, b"", TcpFlags::SYN), now);
        assert_eq!(immediate.len(), 1);
    }

    #[test]
    fn first_syn_registers_a_new_flow() {
        let mut flows = ConnectionTable::new();
        let mut sf = SfScheduler::new(SfMakerConfig::default());
        let now = quanta::Instant::now();

        handle_packet(&mut flows, &mut sf, packet_at(0, 0, b"", TcpFlags::SYN), now);
        assert_eq!(flows.len(), 1);
    }

    #[test]
    fn channel_sink_forwards_packets() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut sink = ChannelSink(tx);
        sink.send(packet_at(0, 0, b"", TcpFlags::SYN));
        assert!(rx.try_recv().is_ok());
    }
}
