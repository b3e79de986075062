//! # mbox-wire
//!
//! Wire-format codec for the transparent TCP middlebox: Ethernet/IPv4/TCP
//! header parsing and re-serialization, wrapping sequence-number arithmetic,
//! and the per-packet annotations threaded through the processing pipeline.
//!
//! This crate has no knowledge of flows, reordering, or rewriting — it only
//! turns bytes into headers and back, and answers "which came first" for
//! sequence numbers living on a 32-bit ring.
//!
//! ## Crate structure
//!
//! - [`seq`] — `Seq32`, wrapping sequence/ack number comparisons (RFC 793 §3.3).
//! - [`checksum`] — RFC 1071 ones-complement checksum helpers.
//! - [`headers`] — `EthernetHeader`, `Ipv4Header`, `TcpHeader`, `TcpOptions`,
//!   `FiveTuple`, and `Annotations`.
//! - [`packet`] — `TcpPacket`, bundling the headers above with payload and
//!   annotations, with parse/encode entry points.

pub mod checksum;
pub mod headers;
pub mod packet;
pub mod seq;

pub use headers::{
    Annotations, EthernetHeader, FiveTuple, Ipv4Header, TcpFlags, TcpHeader, TcpOptions,
    ETHERNET_HEADER_LEN, ETHERTYPE_IPV4, IPV4_MIN_HEADER_LEN, IP_PROTO_TCP, TCP_MIN_HEADER_LEN,
};
pub use packet::TcpPacket;
pub use seq::Seq32;
