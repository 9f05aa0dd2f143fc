// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

use std::time::Duration;

use lockstep_engine::types::SimError;

/// Errors returned by [`ProcessGroup`](crate::ProcessGroup) operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GroupError {
    #[error("process group aborted: {0}")]
    Aborted(String),

    #[error("rank {rank} is not a member of a group of {size}")]
    NoSuchRank { rank: usize, size: usize },

    #[error("mailbox of rank {0} is closed")]
    PeerGone(usize),

    #[error("rank {rank} entered {called} while the group was in {pending}")]
    MismatchedCollective {
        rank: usize,
        called: &'static str,
        pending: &'static str,
    },

    #[error("no message within {0:?}")]
    Timeout(Duration),

    #[error("a process group needs at least one member")]
    Empty,
}

impl From<GroupError> for SimError {
    fn from(e: GroupError) -> Self {
        SimError(e.to_string())
    }
}
