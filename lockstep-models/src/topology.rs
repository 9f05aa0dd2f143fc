// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Leaf-spine topologies and their partition over a process group.
//!
//! Every worker computes the same [`Partition`] from the same global
//! parameters, which is what allows each of them to decide on its own
//! whether it owns a node.
//!
//! ```rust
//! use lockstep_models::topology::{Partition, select};
//!
//! let partition = Partition::new(select(0).unwrap(), 2).unwrap();
//! assert_eq!(partition.num_servers(), 64);
//! assert_eq!(partition.owner(31).unwrap(), 0);
//! assert_eq!(partition.owner(32).unwrap(), 1);
//! ```

use std::fmt;
use std::net::Ipv4Addr;
use std::ops::Range;

use crate::TopologyError;

/// Dimensions of a two-tier leaf-spine fabric.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TopologyShape {
    pub spine: u32,
    pub leaf: u32,
    pub servers_per_leaf: u32,
}

impl TopologyShape {
    #[must_use]
    pub const fn new(spine: u32, leaf: u32, servers_per_leaf: u32) -> Self {
        Self {
            spine,
            leaf,
            servers_per_leaf,
        }
    }

    #[must_use]
    pub fn num_servers(&self) -> u32 {
        self.leaf * self.servers_per_leaf
    }
}

impl fmt::Display for TopologyShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} spines, {} leaves, {} servers per leaf",
            self.spine, self.leaf, self.servers_per_leaf
        )
    }
}

/// The selectable topologies.
pub const TOPOLOGIES: [TopologyShape; 6] = [
    TopologyShape::new(4, 8, 8),
    TopologyShape::new(4, 16, 8),
    TopologyShape::new(8, 32, 8),
    TopologyShape::new(16, 64, 8),
    TopologyShape::new(32, 128, 8),
    TopologyShape::new(64, 256, 8),
];

/// Look up a topology by its index in [`TOPOLOGIES`].
pub fn select(index: usize) -> Result<TopologyShape, TopologyError> {
    TOPOLOGIES
        .get(index)
        .copied()
        .ok_or(TopologyError::UnknownTopology {
            index,
            count: TOPOLOGIES.len(),
        })
}

/// Assignment of the nodes of a [`TopologyShape`] to `processes` owners.
///
/// Servers are dealt out in contiguous blocks of whole leaves, so the leaf
/// count must be a multiple of the process count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Partition {
    shape: TopologyShape,
    processes: u32,
    servers_per_process: u32,
}

impl Partition {
    pub fn new(shape: TopologyShape, processes: u32) -> Result<Self, TopologyError> {
        if processes == 0 {
            return Err(TopologyError::ZeroProcesses);
        }
        if shape.leaf < processes {
            return Err(TopologyError::ZeroShardSize {
                leaves: shape.leaf,
                processes,
            });
        }
        if shape.leaf % processes != 0 {
            return Err(TopologyError::UnevenSplit {
                leaves: shape.leaf,
                processes,
            });
        }
        Ok(Self {
            shape,
            processes,
            servers_per_process: shape.num_servers() / processes,
        })
    }

    #[must_use]
    pub fn shape(&self) -> TopologyShape {
        self.shape
    }

    #[must_use]
    pub fn processes(&self) -> u32 {
        self.processes
    }

    #[must_use]
    pub fn num_servers(&self) -> u32 {
        self.shape.num_servers()
    }

    pub fn validate_node(&self, node: u32) -> Result<(), TopologyError> {
        if node >= self.num_servers() {
            return Err(TopologyError::NodeOutOfRange {
                node,
                servers: self.num_servers(),
            });
        }
        Ok(())
    }

    /// The process that instantiates the endpoints of server `node`.
    pub fn owner(&self, node: u32) -> Result<usize, TopologyError> {
        self.validate_node(node)?;
        Ok((node / self.servers_per_process) as usize)
    }

    /// The process that owns leaf switch `leaf`.
    #[must_use]
    pub fn leaf_owner(&self, leaf: u32) -> usize {
        (leaf / (self.shape.leaf / self.processes)) as usize
    }

    /// The process that owns spine switch `spine`.
    ///
    /// Spines need not divide evenly, the share of each process is fractional.
    #[must_use]
    pub fn spine_owner(&self, spine: u32) -> usize {
        let share = f64::from(self.shape.spine) / f64::from(self.processes);
        let owner = (f64::from(spine) / share).floor() as usize;
        owner.min(self.processes as usize - 1)
    }

    /// Index of the leaf that server `node` hangs off.
    #[must_use]
    pub fn leaf_of(&self, node: u32) -> u32 {
        node / self.shape.servers_per_leaf
    }

    /// Position of server `node` on its leaf.
    #[must_use]
    pub fn server_index(&self, node: u32) -> u32 {
        node % self.shape.servers_per_leaf
    }

    /// The servers owned by process `rank`, in node order.
    pub fn owned_servers(&self, rank: usize) -> Range<u32> {
        let per = self.servers_per_process;
        let first = (rank as u32).saturating_mul(per);
        let end = if rank < self.processes as usize {
            first + per
        } else {
            first
        };
        first..end
    }

    /// Address of server `node`: `10.(leaf+1).1.(2*index+1)`.
    ///
    /// Leaf numbers that overflow the second octet carry into the third, so
    /// leaf 255 is `10.0.2.x`.
    pub fn address(&self, node: u32) -> Result<Ipv4Addr, TopologyError> {
        self.validate_node(node)?;
        let leaf_number = self.leaf_of(node) + 1;
        let third = u8::try_from(1 + (leaf_number >> 8));
        let fourth = u8::try_from(2 * self.server_index(node) + 1);
        match (third, fourth) {
            (Ok(third), Ok(fourth)) => {
                Ok(Ipv4Addr::new(10, (leaf_number & 0xff) as u8, third, fourth))
            }
            _ => Err(TopologyError::NoAddress { node }),
        }
    }

    /// Inverse of [`address`](Partition::address).
    #[must_use]
    pub fn node_of(&self, address: Ipv4Addr) -> Option<u32> {
        let [a, b, c, d] = address.octets();
        if a != 10 || c == 0 || d % 2 == 0 {
            return None;
        }
        let leaf_number = (u32::from(c - 1) << 8) | u32::from(b);
        if leaf_number == 0 {
            return None;
        }
        let leaf = leaf_number - 1;
        let index = u32::from(d - 1) / 2;
        if leaf >= self.shape.leaf || index >= self.shape.servers_per_leaf {
            return None;
        }
        Some(leaf * self.shape.servers_per_leaf + index)
    }

    /// Number of links a segment crosses between two servers.
    #[must_use]
    pub fn hops(&self, src: u32, dst: u32) -> u32 {
        if src == dst {
            0
        } else if self.leaf_of(src) == self.leaf_of(dst) {
            2
        } else {
            4
        }
    }

    /// A stable hash of the global parameters.
    ///
    /// Workers compare fingerprints before loading any work to make sure that
    /// they all partition the fabric the same way.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

        [
            self.shape.spine,
            self.shape.leaf,
            self.shape.servers_per_leaf,
            self.processes,
        ]
        .iter()
        .flat_map(|v| v.to_be_bytes())
        .fold(FNV_OFFSET, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_lookup() {
        assert_eq!(select(2).unwrap(), TopologyShape::new(8, 32, 8));
        assert_eq!(
            select(6),
            Err(TopologyError::UnknownTopology { index: 6, count: 6 })
        );
    }

    #[test]
    fn bad_partitions() {
        let shape = select(0).unwrap();
        assert_eq!(Partition::new(shape, 0), Err(TopologyError::ZeroProcesses));
        assert_eq!(
            Partition::new(shape, 16),
            Err(TopologyError::ZeroShardSize {
                leaves: 8,
                processes: 16
            })
        );
        assert_eq!(
            Partition::new(shape, 3),
            Err(TopologyError::UnevenSplit {
                leaves: 8,
                processes: 3
            })
        );
    }

    #[test]
    fn owners_are_contiguous_blocks() {
        let partition = Partition::new(select(1).unwrap(), 4).unwrap();
        // 128 servers over 4 processes
        assert_eq!(partition.owner(0).unwrap(), 0);
        assert_eq!(partition.owner(31).unwrap(), 0);
        assert_eq!(partition.owner(32).unwrap(), 1);
        assert_eq!(partition.owner(127).unwrap(), 3);
        assert!(partition.owner(128).is_err());

        for rank in 0..4 {
            for node in partition.owned_servers(rank) {
                assert_eq!(partition.owner(node).unwrap(), rank);
            }
        }
        assert_eq!(partition.owned_servers(4).count(), 0);
    }

    #[test]
    fn owner_is_a_pure_function() {
        for (index, shape) in TOPOLOGIES.iter().enumerate() {
            for processes in [1, 2, 4, 8] {
                let a = Partition::new(*shape, processes).unwrap();
                let b = Partition::new(select(index).unwrap(), processes).unwrap();
                assert_eq!(a.fingerprint(), b.fingerprint());
                for node in 0..a.num_servers() {
                    assert_eq!(a.owner(node), b.owner(node));
                }
            }
        }
    }

    #[test]
    fn switch_owners() {
        let partition = Partition::new(select(0).unwrap(), 8).unwrap();
        let leaves: Vec<_> = (0..8).map(|l| partition.leaf_owner(l)).collect();
        assert_eq!(leaves, vec![0, 1, 2, 3, 4, 5, 6, 7]);

        // Four spines shared by eight processes
        let spines: Vec<_> = (0..4).map(|s| partition.spine_owner(s)).collect();
        assert_eq!(spines, vec![0, 2, 4, 6]);

        let partition = Partition::new(select(3).unwrap(), 2).unwrap();
        assert_eq!(partition.spine_owner(7), 0);
        assert_eq!(partition.spine_owner(8), 1);
    }

    #[test]
    fn address_plan() {
        let partition = Partition::new(select(0).unwrap(), 1).unwrap();
        assert_eq!(partition.address(0).unwrap(), Ipv4Addr::new(10, 1, 1, 1));
        assert_eq!(partition.address(9).unwrap(), Ipv4Addr::new(10, 2, 1, 3));
        assert_eq!(partition.address(63).unwrap(), Ipv4Addr::new(10, 8, 1, 15));
        for node in 0..partition.num_servers() {
            let address = partition.address(node).unwrap();
            assert_eq!(partition.node_of(address), Some(node));
        }
        assert_eq!(partition.node_of(Ipv4Addr::new(10, 1, 1, 2)), None);
        assert_eq!(partition.node_of(Ipv4Addr::new(10, 9, 1, 1)), None);
        assert_eq!(partition.node_of(Ipv4Addr::new(192, 168, 1, 1)), None);
    }

    #[test]
    fn every_table_entry_is_addressable() {
        for index in 0..TOPOLOGIES.len() {
            let partition = Partition::new(select(index).unwrap(), 1).unwrap();
            for node in 0..partition.num_servers() {
                let address = partition.address(node).unwrap();
                assert_eq!(partition.node_of(address), Some(node), "{address}");
            }
        }

        let partition = Partition::new(select(5).unwrap(), 1).unwrap();
        assert_eq!(partition.address(254 * 8).unwrap(), Ipv4Addr::new(10, 255, 1, 1));
        assert_eq!(partition.address(2047).unwrap(), Ipv4Addr::new(10, 0, 2, 15));
        assert_eq!(partition.node_of(Ipv4Addr::new(10, 0, 1, 1)), None);
        assert_eq!(partition.node_of(Ipv4Addr::new(10, 1, 2, 1)), None);
    }

    #[test]
    fn hop_counts() {
        let partition = Partition::new(select(0).unwrap(), 1).unwrap();
        assert_eq!(partition.hops(3, 3), 0);
        assert_eq!(partition.hops(0, 7), 2);
        assert_eq!(partition.hops(7, 8), 4);
    }

    #[test]
    fn fingerprint_depends_on_every_parameter() {
        let base = Partition::new(select(1).unwrap(), 2).unwrap();
        let others = [
            Partition::new(select(1).unwrap(), 4).unwrap(),
            Partition::new(TopologyShape::new(8, 16, 8), 2).unwrap(),
            Partition::new(TopologyShape::new(4, 16, 4), 2).unwrap(),
            Partition::new(select(2).unwrap(), 2).unwrap(),
        ];
        for other in others {
            assert_ne!(base.fingerprint(), other.fingerprint());
        }
    }
}
