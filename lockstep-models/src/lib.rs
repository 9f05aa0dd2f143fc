// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Models of one shard of a leaf-spine fabric.
//!
//! The fabric is partitioned over the members of a process group by a
//! [`Partition`](crate::topology::Partition). Each worker builds a
//! [`FabricShard`](crate::fabric::FabricShard) holding the endpoints of the
//! servers it owns:
//!
//!  - [`Sender`](crate::endpoint::Sender)s turn a flow into a
//!    [`QueuePairRequest`](crate::rdma::QueuePairRequest) that a
//!    [`QueuePairDriver`](crate::rdma::QueuePairDriver) cuts into segments.
//!  - [`Receiver`](crate::endpoint::Receiver)s are bound to a (node, port) and
//!    notify every registered [`ArrivalObserver`](crate::endpoint::ArrivalObserver)
//!    of each inbound segment.
//!
//! Segments whose destination is owned by another worker are encoded as a
//! [`SegmentFrame`](crate::segment::SegmentFrame) and posted to that worker's
//! mailbox.

pub mod cn_header;
pub mod endpoint;
pub mod error;
pub mod fabric;
pub mod rdma;
pub mod reception;
pub mod segment;
pub mod topology;

pub use error::{CodecError, TopologyError};

/// Number of segments needed to carry `payload_bytes` with segments of at
/// most `segment_bytes` each.
///
/// ```rust
/// use lockstep_models::segments_for;
///
/// assert_eq!(segments_for(1448, 1448), 1);
/// assert_eq!(segments_for(3000, 1448), 3);
/// assert_eq!(segments_for(0, 1448), 0);
/// ```
#[must_use]
pub fn segments_for(payload_bytes: u64, segment_bytes: u32) -> u64 {
    payload_bytes.div_ceil(u64::from(segment_bytes.max(1)))
}
