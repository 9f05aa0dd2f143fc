// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

use lockstep_engine::types::SimError;

/// Errors decoding wire records.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("buffer too short: need {needed} bytes, {available} available")]
    ShortBuffer { needed: usize, available: usize },

    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),
}

/// Errors describing the fabric layout.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TopologyError {
    #[error("unknown topology {index}, expected 0..{count}")]
    UnknownTopology { index: usize, count: usize },

    #[error("process count must be at least one")]
    ZeroProcesses,

    #[error("{leaves} leaves cannot be shared by {processes} processes")]
    ZeroShardSize { leaves: u32, processes: u32 },

    #[error("{leaves} leaves do not split evenly over {processes} processes")]
    UnevenSplit { leaves: u32, processes: u32 },

    #[error("node {node} is outside a topology of {servers} servers")]
    NodeOutOfRange { node: u32, servers: u32 },

    #[error("node {node} has no address in the 10.x.y.z plan")]
    NoAddress { node: u32 },

    #[error("node {node} is owned by process {owner}, not {rank}")]
    NotOwned { node: u32, owner: usize, rank: usize },
}

impl From<CodecError> for SimError {
    fn from(e: CodecError) -> Self {
        SimError(e.to_string())
    }
}

impl From<TopologyError> for SimError {
    fn from(e: TopologyError) -> Self {
        SimError(e.to_string())
    }
}
