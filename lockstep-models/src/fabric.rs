// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The part of a leaf-spine fabric owned by one worker.
//!
//! A [`FabricShard`] holds the [`Receiver`]s of the servers its worker owns
//! and moves segments between servers. Segments for servers owned by the
//! same worker are delivered after the modelled latency. Segments for any
//! other server are encoded as a [`SegmentFrame`] and posted to the owner's
//! mailbox, where [`inject`](FabricShard::inject) picks them up.
//!
//! Latency is store-and-forward over the links between the two servers:
//! each link adds the propagation delay, each switch re-serialises the
//! segment. Queueing is not modelled.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use bytes::Bytes;
use lockstep_engine::engine::Engine;
use lockstep_engine::executor::Spawner;
use lockstep_engine::sim_error;
use lockstep_engine::time::clock::Clock;
use lockstep_engine::types::{SimError, SimResult};
use lockstep_group::ProcessGroup;
use lockstep_track::entity::Entity;
use lockstep_track::{debug, trace};

use crate::TopologyError;
use crate::endpoint::{Receiver, SegmentContext};
use crate::segment::SegmentFrame;
use crate::topology::Partition;

/// Link parameters shared by every link in the fabric.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FabricConfig {
    pub link_mbps: f64,
    pub link_delay_ns: f64,
    /// Largest payload carried by one segment.
    pub segment_bytes: u32,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            link_mbps: 25.0,
            link_delay_ns: 2000.0,
            segment_bytes: 1448,
        }
    }
}

pub struct FabricShard {
    pub entity: Arc<Entity>,
    partition: Partition,
    rank: usize,
    config: FabricConfig,
    clock: Clock,
    spawner: Spawner,
    group: Rc<dyn ProcessGroup>,
    receivers: RefCell<HashMap<(u32, u16), Rc<Receiver>>>,
    posted: Cell<u64>,
    delivered: Cell<u64>,
}

impl FabricShard {
    /// Create the shard of `partition` owned by this member of `group`.
    pub fn new(
        engine: &mut Engine,
        parent: &Arc<Entity>,
        partition: Partition,
        group: Rc<dyn ProcessGroup>,
        config: FabricConfig,
    ) -> Result<Rc<Self>, SimError> {
        if partition.processes() as usize != group.size() {
            return sim_error!(format!(
                "fabric split over {} processes but the group has {} members",
                partition.processes(),
                group.size()
            ));
        }
        if config.segment_bytes == 0 || config.link_mbps <= 0.0 {
            return sim_error!(format!("invalid link parameters {config:?}"));
        }

        let entity = Arc::new(Entity::new(parent, "fabric"));
        let rank = group.rank();
        debug!(entity ; "rank {} owns servers {:?} of {}", rank, partition.owned_servers(rank), partition.shape());
        Ok(Rc::new(Self {
            entity,
            partition,
            rank,
            config,
            clock: engine.default_clock(),
            spawner: engine.spawner.clone(),
            group,
            receivers: RefCell::new(HashMap::new()),
            posted: Cell::new(0),
            delivered: Cell::new(0),
        }))
    }

    #[must_use]
    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[must_use]
    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    #[must_use]
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    #[must_use]
    pub fn spawner(&self) -> &Spawner {
        &self.spawner
    }

    #[must_use]
    pub fn owns(&self, node: u32) -> bool {
        self.partition.owner(node).is_ok_and(|owner| owner == self.rank)
    }

    /// Get the receiver on (`node`, `port`), creating it if necessary.
    ///
    /// The flag is `true` if the receiver was created by this call.
    pub fn bind_receiver(&self, node: u32, port: u16) -> Result<(Rc<Receiver>, bool), SimError> {
        let owner = self.partition.owner(node)?;
        if owner != self.rank {
            return Err(TopologyError::NotOwned {
                node,
                owner,
                rank: self.rank,
            }
            .into());
        }

        let mut receivers = self.receivers.borrow_mut();
        if let Some(receiver) = receivers.get(&(node, port)) {
            return Ok((receiver.clone(), false));
        }
        let receiver = Receiver::new(&self.entity, node, port);
        receivers.insert((node, port), receiver.clone());
        Ok((receiver, true))
    }

    /// Unbind the receiver on (`node`, `port`). Segments still addressed to
    /// it become delivery errors.
    pub fn release_receiver(&self, node: u32, port: u16) -> bool {
        self.receivers.borrow_mut().remove(&(node, port)).is_some()
    }

    #[must_use]
    pub fn receiver(&self, node: u32, port: u16) -> Option<Rc<Receiver>> {
        self.receivers.borrow().get(&(node, port)).cloned()
    }

    #[must_use]
    pub fn num_receivers(&self) -> usize {
        self.receivers.borrow().len()
    }

    /// Time to clock `bytes` onto one link.
    #[must_use]
    pub fn serialisation_ns(&self, bytes: u32) -> f64 {
        f64::from(bytes) * 8000.0 / self.config.link_mbps
    }

    /// Time from the last bit leaving `src` until the segment is at `dst`.
    #[must_use]
    pub fn latency_ns(&self, src: u32, dst: u32, bytes: u32) -> f64 {
        let hops = self.partition.hops(src, dst);
        if hops == 0 {
            return 0.0;
        }
        f64::from(hops) * self.config.link_delay_ns
            + f64::from(hops - 1) * self.serialisation_ns(bytes)
    }

    /// Send a segment that finished leaving its source at `ctx.arrival_ns`.
    pub fn transmit(self: &Rc<Self>, ctx: SegmentContext) -> SimResult {
        let arrival_ns = ctx.arrival_ns + self.latency_ns(ctx.src_node, ctx.dst_node, ctx.payload_len);
        let ctx = SegmentContext { arrival_ns, ..ctx };

        let owner = self.partition.owner(ctx.dst_node)?;
        if owner == self.rank {
            self.schedule_delivery(ctx);
        } else {
            trace!(self.entity ; "post {} to rank {}", ctx, owner);
            self.group
                .send(owner, SegmentFrame::from_context(&ctx).encode())?;
            self.posted.set(self.posted.get() + 1);
        }
        Ok(())
    }

    /// Accept a frame posted by another worker.
    ///
    /// A frame stamped with a time that has already passed here is delivered
    /// now.
    pub fn inject(self: &Rc<Self>, payload: Bytes) -> SimResult {
        let frame = SegmentFrame::decode(payload)?;
        let mut ctx = frame.to_context();
        if !self.owns(ctx.dst_node) {
            return sim_error!(format!(
                "{}: received {} for a server owned by another process",
                self.entity, ctx
            ));
        }
        ctx.arrival_ns = ctx.arrival_ns.max(self.clock.time_now_ns());
        self.schedule_delivery(ctx);
        Ok(())
    }

    fn schedule_delivery(self: &Rc<Self>, ctx: SegmentContext) {
        let shard = self.clone();
        self.spawner.spawn(async move {
            let wait_ns = ctx.arrival_ns - shard.clock.time_now_ns();
            if wait_ns > 0.0 {
                shard.clock.wait_ticks(shard.clock.ns_to_ticks(wait_ns)).await;
            }
            let Some(receiver) = shard.receiver(ctx.dst_node, ctx.dst_port) else {
                return sim_error!(format!("{}: nothing listening for {}", shard.entity, ctx));
            };
            shard.delivered.set(shard.delivered.get() + 1);
            receiver.on_segment(&SegmentContext {
                arrival_ns: shard.clock.time_now_ns(),
                ..ctx
            })
        });
    }

    /// Segments posted to other workers.
    #[must_use]
    pub fn posted(&self) -> u64 {
        self.posted.get()
    }

    /// Segments delivered to receivers of this shard.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.get()
    }
}
