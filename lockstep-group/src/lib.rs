// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Groups of cooperating worker processes.
//!
//! A [`ProcessGroup`] is the only way workers coordinate. It provides
//! collectives that every member must join before any of them can proceed
//! ([`barrier`](ProcessGroup::barrier), [`all_reduce`](ProcessGroup::all_reduce)
//! and [`split`](ProcessGroup::split)) plus an unordered point-to-point
//! mailbox used to carry segments between shards.
//!
//! [`LocalWorld`] implements a group of worker threads inside one OS process.
//!
//! ```rust
//! use lockstep_group::{LocalWorld, ProcessGroup};
//!
//! let groups = LocalWorld::new(3).unwrap().into_groups();
//! std::thread::scope(|s| {
//!     for group in groups {
//!         s.spawn(move || {
//!             let total = group.all_reduce_sum(1).unwrap();
//!             assert_eq!(total, group.size() as u64);
//!         });
//!     }
//! });
//! ```

use std::time::Duration;

use bytes::Bytes;

pub mod error;
pub mod local;

pub use error::GroupError;
pub use local::{LocalGroup, LocalWorld};

/// The reduction applied by [`ProcessGroup::all_reduce`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
    Min,
}

impl ReduceOp {
    /// Combine two contributions.
    #[must_use]
    pub fn apply(self, a: u64, b: u64) -> u64 {
        match self {
            ReduceOp::Sum => a.saturating_add(b),
            ReduceOp::Max => a.max(b),
            ReduceOp::Min => a.min(b),
        }
    }
}

/// A message delivered through a member's mailbox.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    /// Rank of the sender within the group the message was sent on.
    pub from: usize,
    pub payload: Bytes,
}

/// A fixed group of processes.
///
/// Every collective must be called by all members in the same order.
pub trait ProcessGroup: Send {
    /// This member's index within the group, in `0..size()`.
    fn rank(&self) -> usize;

    /// Number of members.
    fn size(&self) -> usize;

    /// Block until every member has called `barrier`.
    fn barrier(&self) -> Result<(), GroupError>;

    /// Combine `value` from every member with `op` and return the result to
    /// all of them.
    fn all_reduce(&self, value: u64, op: ReduceOp) -> Result<u64, GroupError>;

    fn all_reduce_sum(&self, value: u64) -> Result<u64, GroupError> {
        self.all_reduce(value, ReduceOp::Sum)
    }

    /// Partition the group. Members passing the same `color` form a new
    /// group in which they are ranked by `key` (ties broken by current rank).
    fn split(&self, color: u32, key: usize) -> Result<Self, GroupError>
    where
        Self: Sized;

    /// Post `payload` into the mailbox of member `dest`.
    fn send(&self, dest: usize, payload: Bytes) -> Result<(), GroupError>;

    /// Take the next message from this member's mailbox if there is one.
    fn try_recv(&self) -> Result<Option<Envelope>, GroupError>;

    /// Wait up to `timeout` for the next message.
    ///
    /// Returns [`GroupError::Timeout`] if nothing arrived in time.
    fn recv_timeout(&self, timeout: Duration) -> Result<Envelope, GroupError>;

    /// Poison the group. Every member blocked in, or later entering, a
    /// collective or a receive gets [`GroupError::Aborted`].
    fn abort(&self, reason: &str);
}
