//! Frame protocol - message envelope shared by both endpoints.
//!
//! Method indices and control codes share one numeric namespace but occupy
//! disjoint ranges: method indices count up from 0 in table order, control
//! codes count down from 255. The gap is enforced at table construction
//! ([`MAX_METHODS`]), so the first element of any decoded frame
//! unambiguously selects control handling or method dispatch.

mod packet;

pub use packet::{Packet, PacketCodec};

/// Highest number of methods one table may declare.
pub const MAX_METHODS: usize = 250;

/// Control code of the version handshake frame.
pub const VERSION_CODE: u64 = 255;

/// Control code of the promise-resolution frame.
pub const RESOLVED_CODE: u64 = 254;

/// Control code of the promise-rejection frame.
pub const REJECTED_CODE: u64 = 253;
