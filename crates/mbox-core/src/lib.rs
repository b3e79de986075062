//! # mbox-core
//!
//! The transparent TCP middlebox core: per-direction byte-stream rewriting,
//! reordering, retransmission, and the flow state that ties a connection's
//! two directions together.
//!
//! A flow is represented by a [`fcb::TcpConnection`] shared between its two
//! [`tcp_in::TcpIn`]/[`tcp_out::TcpOut`] halves. Packets flow
//! `TcpIn::process` → (reorder, rewrite) → `TcpOut::process`; each half only
//! ever touches its own direction's [`maintainer::ByteStreamMaintainer`] and
//! reads the other's, matching the original design's per-direction locking
//! discipline — a single mutex around the shared [`fcb::TcpConnection`] is
//! the only lock taken on the packet-processing path.
//!
//! ## Crate structure
//!
//! - [`maintainer`] — `ByteStreamMaintainer`, the ack/seq modification trees.
//! - [`modlist`] — `ModificationList`, staged edits committed atomically.
//! - [`flow_buffer`] — `FlowBuffer`, cross-packet content search/rewrite.
//! - [`reorder`] — `Reorderer`, gap-buffering in-order delivery.
//! - [`closing`] — `ClosingState`, the graceful/ungraceful teardown machine.
//! - [`retransmit`] — `CircularBuffer` + `RetransmitState`, RTO timing.
//! - [`fcb`] — `TcpConnection`, `ConnectionTable`, the shared per-flow state.
//! - [`synthetic`] — forging ACK/FIN/RST segments the middlebox originates.
//! - [`tcp_in`] / [`tcp_out`] — the ingress/egress halves of a direction.
//! - [`tcp_retransmitter`] — middlebox-originated resends from the buffer.

pub mod closing;
pub mod fcb;
pub mod flow_buffer;
pub mod maintainer;
pub mod modlist;
pub mod reorder;
pub mod retransmit;
pub mod synthetic;
pub mod tcp_in;
pub mod tcp_out;
pub mod tcp_retransmitter;

pub use fcb::{ConnectionTable, Direction, SharedConnection, TcpConnection};
pub use maintainer::ByteStreamMaintainer;
pub use modlist::ModificationList;
pub use reorder::{ReorderOutcome, Reorderer};
pub use tcp_in::{TcpIn, TcpInOutcome};
pub use tcp_out::{TcpOut, TcpOutOutcome};
pub use tcp_retransmitter::TcpRetransmitter;
