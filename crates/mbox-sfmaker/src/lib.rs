//! # mbox-sfmaker
//!
//! The reframer: buffers each flow's packets for up to `DELAY` hoping to
//! merge bursts, then drains ready flows in priority order into bounded
//! output batches. Sits downstream of [`mbox_core::tcp_out::TcpOut`] in the
//! pipeline, just before the NIC TX ring.

pub mod config;
pub mod scheduler;
pub mod slot;

pub use config::{ConfigError, Model, Prio, SfMakerConfig};
pub use scheduler::{SfOutcome, SfScheduler};
pub use slot::SfSlot;
