//! # Retransmission buffer and RTO timing
//!
//! Each direction keeps a [`CircularBuffer`] of the bytes it has ACKed on
//! behalf of the real endpoint but the endpoint hasn't ACKed yet, so that if
//! that data is lost in flight the middlebox — not the original sender —
//! can resend it. [`RetransmitState`] layers Jacobson/Karels RTO estimation
//! (RFC 6298, same coefficients as [`crate::session`]'s `RttTracker`) and a
//! small state machine over that buffer to decide when a resend is due.

use std::time::Duration;

use mbox_wire::Seq32;

const DEFAULT_CAPACITY: usize = 65536;

/// A growable ring buffer of bytes addressed by absolute sequence number.
/// Positions outside `[start_offset, start_offset + len)` are not buffered.
pub struct CircularBuffer {
    data: Vec<u8>,
    start: usize, // index into `data` of the first buffered byte
    len: usize,
    start_offset: Option<Seq32>,
}

impl CircularBuffer {
    pub fn new() -> Self {
        CircularBuffer {
            data: vec![0u8; DEFAULT_CAPACITY],
            start: 0,
            len: 0,
            start_offset: None,
        }
    }

    pub fn is_blank(&self) -> bool {
        self.start_offset.is_none()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn start_offset(&self) -> Option<Seq32> {
        self.start_offset
    }

    fn set_start_offset(&mut self, seq: Seq32) {
        self.start_offset = Some(seq);
    }

    fn grow_to_fit(&mut self, additional: usize) {
        if self.len + additional <= self.capacity() {
            return;
        }
        let new_cap = (self.len + additional).next_power_of_two();
        let mut new_data = vec![0u8; new_cap];
        for i in 0..self.len {
            new_data[i] = self.data[(self.start + i) % self.data.len()];
        }
        self.data = new_data;
        self.start = 0;
        tracing::warn!(added = additional, "retransmission buffer needed more space");
    }

    pub fn add_data_at_end(&mut self, seq_of_first_byte_if_blank: Seq32, bytes: &[u8]) {
        if self.is_blank() {
            self.set_start_offset(seq_of_first_byte_if_blank);
        }
        self.grow_to_fit(bytes.len());
        let cap = self.data.len();
        let mut pos = (self.start + self.len) % cap;
        for &b in bytes {
            self.data[pos] = b;
            pos = (pos + 1) % cap;
        }
        self.len += bytes.len();
    }

    /// Drop buffered bytes below `new_start` (a sequence number, not a byte
    /// count) now that the real endpoint has ACKed them.
    pub fn remove_data_at_beginning(&mut self, new_start: Seq32) {
        let Some(offset) = self.start_offset else { return };
        if new_start.leq(offset) {
            return;
        }
        let n_removed = (new_start.distance(offset).unsigned_abs() as usize).min(self.len);
        self.start = (self.start + n_removed) % self.data.len().max(1);
        self.len -= n_removed;
        self.start_offset = Some(new_start);
    }

    /// Fetch `length` bytes starting at sequence number `start`.
    pub fn get_data(&self, start: Seq32, length: usize) -> Vec<u8> {
        let Some(offset) = self.start_offset else { return Vec::new() };
        if start.lt(offset) {
            tracing::error!("requested retransmission data not in the buffer");
            return Vec::new();
        }
        let skip = start.distance(offset) as usize;
        let length = length.min(self.len.saturating_sub(skip));
        let cap = self.data.len();
        (0..length)
            .map(|i| self.data[(self.start + skip + i) % cap])
            .collect()
    }
}

impl Default for CircularBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// RTO timer state machine. `Measuring` tracks one in-flight RTT sample;
/// `Timing` is the armed retransmission timer; `Retry` means the timer fired
/// and the RTO has been doubled per RFC 6298 §5.5, awaiting the retransmit
/// to be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RtoPhase {
    #[default]
    Idle,
    Measuring,
    Timing,
    Retry,
}

const K: f64 = 4.0;
const ALPHA: f64 = 1.0 / 8.0;
const BETA: f64 = 1.0 / 4.0;
const MIN_RTO: Duration = Duration::from_millis(200);
const MAX_RTO: Duration = Duration::from_secs(60);

pub struct RetransmitState {
    pub buffer: CircularBuffer,
    phase: RtoPhase,
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    measure_started_at: Option<quanta::Instant>,
    measure_seq: Seq32,
    last_manual_transmission: Option<Seq32>,
    armed_at: Option<quanta::Instant>,
}

impl RetransmitState {
    pub fn new() -> Self {
        RetransmitState {
            buffer: CircularBuffer::new(),
            phase: RtoPhase::Idle,
            srtt: None,
            rttvar: Duration::ZERO,
            rto: Duration::from_secs(1),
            measure_started_at: None,
            measure_seq: Seq32::ZERO,
            last_manual_transmission: None,
            armed_at: None,
        }
    }

    pub fn phase(&self) -> RtoPhase {
        self.phase
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn manual_transmission_done(&self) -> bool {
        self.last_manual_transmission.is_some()
    }

    pub fn last_manual_transmission(&self) -> Option<Seq32> {
        self.last_manual_transmission
    }

    pub fn set_last_manual_transmission(&mut self, seq: Seq32) {
        self.last_manual_transmission = Some(seq);
    }

    /// Start a new RTT measurement if one isn't already in flight.
    pub fn start_rtt_measure(&mut self, seq: Seq32, now: quanta::Instant) {
        if self.phase == RtoPhase::Measuring {
            return;
        }
        self.phase = RtoPhase::Measuring;
        self.measure_started_at = Some(now);
        self.measure_seq = seq;
    }

    /// An ACK for `ack` arrived; if it matches the in-flight measurement,
    /// fold the sample into the Jacobson/Karels estimators.
    pub fn signal_ack(&mut self, ack: Seq32, now: quanta::Instant) {
        if self.phase != RtoPhase::Measuring {
            return;
        }
        if ack.lt(self.measure_seq) {
            return;
        }
        if let Some(started) = self.measure_started_at.take() {
            let rtt = now.saturating_duration_since(started);
            self.update_rto(rtt);
        }
        self.phase = RtoPhase::Timing;
    }

    /// A retransmission was just sent for data up to `expected_ack` —
    /// cancel any in-flight RTT measurement so the retransmitted data's ACK
    /// doesn't get folded in (Karn's algorithm).
    pub fn signal_retransmission(&mut self, _expected_ack: Seq32) {
        self.measure_started_at = None;
        if self.phase == RtoPhase::Measuring {
            self.phase = RtoPhase::Timing;
        }
    }

    fn update_rto(&mut self, rtt: Duration) {
        let rtt_s = rtt.as_secs_f64();
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2;
            }
            Some(srtt) => {
                let srtt_s = srtt.as_secs_f64();
                let rttvar_s = self.rttvar.as_secs_f64();
                let new_rttvar_s = (1.0 - BETA) * rttvar_s + BETA * (srtt_s - rtt_s).abs();
                let new_srtt_s = (1.0 - ALPHA) * srtt_s + ALPHA * rtt_s;
                self.rttvar = Duration::from_secs_f64(new_rttvar_s.max(0.0));
                self.srtt = Some(Duration::from_secs_f64(new_srtt_s.max(0.0)));
            }
        }
        let srtt = self.srtt.unwrap();
        let rto_s = srtt.as_secs_f64() + K * self.rttvar.as_secs_f64();
        self.rto = Duration::from_secs_f64(rto_s).clamp(MIN_RTO, MAX_RTO);
    }

    pub fn start_timer(&mut self, now: quanta::Instant) {
        if self.phase != RtoPhase::Timing {
            self.phase = RtoPhase::Timing;
            self.armed_at = Some(now);
        }
    }

    pub fn stop_timer(&mut self) {
        if matches!(self.phase, RtoPhase::Timing | RtoPhase::Retry) {
            self.phase = RtoPhase::Idle;
            self.armed_at = None;
        }
    }

    pub fn restart_timer(&mut self, now: quanta::Instant) {
        self.phase = RtoPhase::Timing;
        self.armed_at = Some(now);
    }

    pub fn is_timer_running(&self) -> bool {
        matches!(self.phase, RtoPhase::Timing | RtoPhase::Retry)
    }

    /// The deadline at which a running `Timing` phase should fire, or `None`
    /// if the timer isn't armed (including while already in `Retry`, which
    /// has already fired and is awaiting the actual resend).
    pub fn deadline(&self) -> Option<quanta::Instant> {
        if self.phase != RtoPhase::Timing {
            return None;
        }
        self.armed_at.map(|at| at + self.rto)
    }

    /// The retransmission timer fired: double the RTO (exponential backoff,
    /// RFC 6298 §5.5) and enter `Retry`.
    pub fn on_timer_fired(&mut self) {
        self.rto = (self.rto * 2).min(MAX_RTO);
        self.phase = RtoPhase::Retry;
        self.armed_at = None;
    }

    /// Three duplicate ACKs arrived: force an immediate retransmit without
    /// the exponential-backoff penalty that a genuine timeout incurs.
    pub fn fire_now(&mut self) {
        self.phase = RtoPhase::Retry;
        self.armed_at = None;
    }
}

impl Default for RetransmitState {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute how much of `expected` bytes can be sent right now given the
/// congestion window and (optionally scaled) receiver window, mirroring the
/// classic `cwnd`/`rwnd` clamp. `in_flight` is bytes sent but not yet ACKed.
/// When `can_cut` is false, returns 0 if `expected` would exceed either
/// window rather than truncating to fit.
pub fn clamp_to_windows(
    expected: u32,
    in_flight: u32,
    congestion_window: u64,
    receiver_window: u64,
    can_cut: bool,
) -> u32 {
    let mut allowed = expected as u64;

    if in_flight as u64 + allowed > congestion_window {
        if can_cut {
            allowed = congestion_window.saturating_sub(in_flight as u64);
        } else {
            return 0;
        }
    }

    if in_flight as u64 + allowed > receiver_window {
        if can_cut {
            allowed = receiver_window.saturating_sub(in_flight as u64);
        } else {
            allowed = 0;
        }
    }

    allowed.min(u32::MAX as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circular_buffer_append_and_read_back() {
        let mut buf = CircularBuffer::new();
        buf.add_data_at_end(Seq32::new(100), b"hello world");
        assert_eq!(buf.get_data(Seq32::new(100), 5), b"hello");
        assert_eq!(buf.get_data(Seq32::new(106), 5), b"world");
    }

    #[test]
    fn circular_buffer_prunes_acked_prefix() {
        let mut buf = CircularBuffer::new();
        buf.add_data_at_end(Seq32::new(0), b"0123456789");
        buf.remove_data_at_beginning(Seq32::new(5));
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.get_data(Seq32::new(5), 5), b"56789");
    }

    #[test]
    fn circular_buffer_grows_past_initial_capacity() {
        let mut buf = CircularBuffer::new();
        let chunk = vec![0xABu8; DEFAULT_CAPACITY];
        buf.add_data_at_end(Seq32::new(0), &chunk);
        buf.add_data_at_end(Seq32::new(0), &chunk);
        assert_eq!(buf.len(), DEFAULT_CAPACITY * 2);
        assert!(buf.capacity() >= DEFAULT_CAPACITY * 2);
    }

    #[test]
    fn rto_converges_after_several_samples() {
        let mut state = RetransmitState::new();
        let t0 = quanta::Instant::now();
        let initial_rto = state.rto();
        state.start_rtt_measure(Seq32::new(0), t0);
        state.signal_ack(Seq32::new(1), t0 + Duration::from_millis(100));
        assert!(state.rto() != initial_rto || state.srtt.is_some());
    }

    #[test]
    fn timer_fired_doubles_rto() {
        let mut state = RetransmitState::new();
        state.start_timer(quanta::Instant::now());
        let before = state.rto();
        state.on_timer_fired();
        assert_eq!(state.rto(), (before * 2).min(MAX_RTO));
        assert_eq!(state.phase(), RtoPhase::Retry);
    }

    #[test]
    fn deadline_tracks_armed_at_plus_rto() {
        let mut state = RetransmitState::new();
        assert_eq!(state.deadline(), None);
        let now = quanta::Instant::now();
        state.start_timer(now);
        assert_eq!(state.deadline(), Some(now + state.rto()));
        state.on_timer_fired();
        assert_eq!(state.deadline(), None);
    }

    #[test]
    fn clamp_respects_both_windows() {
        assert_eq!(clamp_to_windows(1000, 0, 500, 10_000, true), 500);
        assert_eq!(clamp_to_windows(1000, 0, 10_000, 300, true), 300);
        assert_eq!(clamp_to_windows(1000, 0, 500, 300, false), 0);
    }
}
