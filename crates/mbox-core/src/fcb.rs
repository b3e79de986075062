//! # Flow control block
//!
//! `TcpConnection` is the state shared by both directions of a TCP flow —
//! the byte-stream maintainers, closing states, and retransmission buffers.
//! Each direction's `TCPIn`/`TCPOut` pair holds an `Arc<Mutex<TcpConnection>>`
//! to the same instance; the mutex is the only lock taken on the processing
//! fast path (see the crate-level concurrency notes in `lib.rs`).

use std::sync::{Arc, Mutex};

use mbox_wire::FiveTuple;

use crate::closing::ClosingState;
use crate::maintainer::ByteStreamMaintainer;
use crate::retransmit::RetransmitState;

/// Which side of the connection a packet is travelling: `Forward` is
/// client-to-server, `Reverse` is server-to-client. Values are `0`/`1` to
/// double as array indices, matching the two-element per-direction state
/// throughout this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Direction {
    Forward = 0,
    Reverse = 1,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Forward => Direction::Reverse,
            Direction::Reverse => Direction::Forward,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

pub struct TcpConnection {
    pub five_tuple: FiveTuple,
    pub maintainers: [ByteStreamMaintainer; 2],
    pub closing_states: [ClosingState; 2],
    pub retransmit: [RetransmitState; 2],
}

impl TcpConnection {
    pub fn new(five_tuple: FiveTuple) -> Self {
        TcpConnection {
            five_tuple,
            maintainers: [ByteStreamMaintainer::new(), ByteStreamMaintainer::new()],
            closing_states: [ClosingState::Open, ClosingState::Open],
            retransmit: [RetransmitState::new(), RetransmitState::new()],
        }
    }

    pub fn maintainer(&self, dir: Direction) -> &ByteStreamMaintainer {
        &self.maintainers[dir.index()]
    }

    pub fn maintainer_mut(&mut self, dir: Direction) -> &mut ByteStreamMaintainer {
        &mut self.maintainers[dir.index()]
    }

    pub fn retransmit(&self, dir: Direction) -> &RetransmitState {
        &self.retransmit[dir.index()]
    }

    pub fn retransmit_mut(&mut self, dir: Direction) -> &mut RetransmitState {
        &mut self.retransmit[dir.index()]
    }

    pub fn closing_state(&self, dir: Direction) -> ClosingState {
        self.closing_states[dir.index()]
    }

    pub fn set_closing_state(&mut self, dir: Direction, state: ClosingState) {
        self.closing_states[dir.index()] = state;
    }

    /// Both directions fully closed (either gracefully or not).
    pub fn is_fully_closed(&self) -> bool {
        self.closing_states.iter().all(|s| s.is_closed())
    }
}

pub type SharedConnection = Arc<Mutex<TcpConnection>>;

pub fn new_shared_connection(five_tuple: FiveTuple) -> SharedConnection {
    Arc::new(Mutex::new(TcpConnection::new(five_tuple)))
}

/// Registry mapping each flow's unordered 5-tuple key to its shared
/// connection state — the "`tcp_common` hash table" of the original design,
/// one instance per worker thread in the cooperative pinned-thread model.
#[derive(Default)]
pub struct ConnectionTable {
    flows: std::collections::HashMap<(std::net::Ipv4Addr, std::net::Ipv4Addr, u16, u16), SharedConnection>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        ConnectionTable::default()
    }

    pub fn get_or_insert(&mut self, five_tuple: FiveTuple) -> SharedConnection {
        self.flows
            .entry(five_tuple.unordered_key())
            .or_insert_with(|| new_shared_connection(five_tuple))
            .clone()
    }

    pub fn get(&self, five_tuple: FiveTuple) -> Option<SharedConnection> {
        self.flows.get(&five_tuple.unordered_key()).cloned()
    }

    pub fn remove(&mut self, five_tuple: FiveTuple) {
        self.flows.remove(&five_tuple.unordered_key());
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Iterate every live flow's shared connection, for a periodic sweep
    /// (e.g. RTO timer expiry) that isn't triggered by an inbound packet.
    pub fn iter(&self) -> impl Iterator<Item = &SharedConnection> {
        self.flows.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn connection_table_shares_state_across_directions() {
        let mut table = ConnectionTable::new();
        let fwd = FiveTuple::new(Ipv4Addr::new(10, 0, 0, 1), 1000, Ipv4Addr::new(10, 0, 0, 2), 80);
        let rev = fwd.reversed();

        let a = table.get_or_insert(fwd);
        let b = table.get_or_insert(rev);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn direction_opposite_round_trips() {
        assert_eq!(Direction::Forward.opposite(), Direction::Reverse);
        assert_eq!(Direction::Reverse.opposite().opposite(), Direction::Reverse);
    }
}
