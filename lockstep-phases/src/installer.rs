// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Installation of flows on the shard owned by this worker.
//!
//! Every worker sees every flow of a phase. The installer decides from the
//! [`Partition`](lockstep_models::topology::Partition) which ends of the flow
//! it owns and only builds those:
//!
//!  - the source owner starts a [`Sender`] for the whole payload.
//!  - the destination owner binds a [`Receiver`] on the phase's port and
//!    counts the segments it must see before the phase can end here.
//!
//! A flow owned entirely by other workers installs nothing.
//!
//! [`Receiver`]: lockstep_models::endpoint::Receiver

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use lockstep_engine::types::SimError;
use lockstep_models::endpoint::{ArrivalObserver, Sender};
use lockstep_models::fabric::FabricShard;
use lockstep_models::rdma::{LONG_CEILING_NS, QueuePairDriver, RdmaClient};
use lockstep_models::reception::ReceptionTracker;
use lockstep_models::segments_for;
use lockstep_track::entity::Entity;
use lockstep_track::{debug, trace};

use crate::workload::FlowDescriptor;

/// The ends of a flow that this worker owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Neither,
    SenderOnly,
    ReceiverOnly,
    Both,
}

impl Role {
    fn new(sends: bool, receives: bool) -> Self {
        match (sends, receives) {
            (false, false) => Role::Neither,
            (true, false) => Role::SenderOnly,
            (false, true) => Role::ReceiverOnly,
            (true, true) => Role::Both,
        }
    }

    #[must_use]
    pub fn sends(self) -> bool {
        matches!(self, Role::SenderOnly | Role::Both)
    }

    #[must_use]
    pub fn receives(self) -> bool {
        matches!(self, Role::ReceiverOnly | Role::Both)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Neither => "neither",
            Role::SenderOnly => "sender",
            Role::ReceiverOnly => "receiver",
            Role::Both => "sender+receiver",
        };
        write!(f, "{s}")
    }
}

/// What one call to [`FlowInstaller::install`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Installation {
    pub role: Role,
    /// Segments this worker must now additionally receive.
    pub expected_segments: u64,
    /// False if the flow had already been installed.
    pub fresh: bool,
}

pub struct FlowInstaller {
    pub entity: Arc<Entity>,
    fabric: Rc<FabricShard>,
    driver: Rc<dyn QueuePairDriver>,
    reception: Rc<ReceptionTracker>,
    completion: Rc<dyn ArrivalObserver>,
    qp_window: u32,
    phase: Cell<Option<usize>>,
    installed: RefCell<HashSet<(usize, usize)>>,
    bound: RefCell<Vec<(u32, u16)>>,
    senders: RefCell<Vec<Rc<Sender>>>,
}

impl FlowInstaller {
    /// `completion` is attached to every receiver this installer creates, in
    /// addition to `reception`.
    pub fn new(
        parent: &Arc<Entity>,
        fabric: &Rc<FabricShard>,
        driver: Rc<dyn QueuePairDriver>,
        reception: &Rc<ReceptionTracker>,
        completion: Rc<dyn ArrivalObserver>,
        qp_window: u32,
    ) -> Self {
        Self {
            entity: Arc::new(Entity::new(parent, "installer")),
            fabric: fabric.clone(),
            driver,
            reception: reception.clone(),
            completion,
            qp_window,
            phase: Cell::new(None),
            installed: RefCell::new(HashSet::new()),
            bound: RefCell::new(Vec::new()),
            senders: RefCell::new(Vec::new()),
        }
    }

    /// Decide which ends of `flow` this worker owns.
    pub fn role(&self, flow: &FlowDescriptor) -> Result<Role, SimError> {
        let partition = self.fabric.partition();
        let rank = self.fabric.rank();
        let sends = partition.owner(flow.src_node)? == rank;
        let receives = partition.owner(flow.dst_node)? == rank;
        Ok(Role::new(sends, receives))
    }

    /// Forget the flows of the previous phase and release the receivers
    /// bound for them.
    pub fn start_phase(&self, phase: usize) {
        if self.phase.replace(Some(phase)) == Some(phase) {
            return;
        }
        self.installed.borrow_mut().retain(|&(p, _)| p == phase);
        for (node, port) in self.bound.borrow_mut().drain(..) {
            self.fabric.release_receiver(node, port);
        }
        trace!(self.entity ; "starting phase {}", phase);
    }

    /// Number of flows installed since the current phase started.
    #[must_use]
    pub fn num_installed(&self) -> usize {
        self.installed.borrow().len()
    }

    /// Install flow `index` of `phase`.
    ///
    /// Installing the same flow again does nothing and expects no further
    /// segments.
    pub fn install(
        &self,
        phase: usize,
        index: usize,
        flow: &FlowDescriptor,
    ) -> Result<Installation, SimError> {
        let role = self.role(flow)?;
        if !self.installed.borrow_mut().insert((phase, index)) {
            trace!(self.entity ; "phase {} flow {} already installed", phase, index);
            return Ok(Installation {
                role,
                expected_segments: 0,
                fresh: false,
            });
        }

        let mut expected_segments = 0;
        if role.receives() {
            let (receiver, created) = self.fabric.bind_receiver(flow.dst_node, flow.dst_port)?;
            if created {
                receiver.add_observer(self.reception.clone());
                receiver.add_observer(self.completion.clone());
                self.bound.borrow_mut().push((flow.dst_node, flow.dst_port));
            }
            expected_segments = segments_for(flow.payload_len, self.fabric.config().segment_bytes);
            self.reception.expect(phase, expected_segments);
        }

        if role.sends() {
            let partition = self.fabric.partition();
            let src = partition.address(flow.src_node)?;
            let dst = partition.address(flow.dst_node)?;
            let mss = self.fabric.config().segment_bytes;
            let base_rtt = 2.0 * self.fabric.latency_ns(flow.src_node, flow.dst_node, mss);
            let request = RdmaClient::new()
                .priority_group(flow.priority)
                .local(src, flow.src_port)
                .remote(dst, flow.dst_port)
                .write_size(flow.payload_len)
                .window(self.qp_window)
                .base_rtt(base_rtt.ceil() as u64)
                .stop_time(self.fabric.clock().time_now_ns() + LONG_CEILING_NS)
                .request();
            let sender = Sender::new(
                &self.entity,
                &format!("phase{phase}::flow{index}"),
                request,
            );
            sender.start(self.driver.as_ref())?;
            self.senders.borrow_mut().push(sender);
        }

        debug!(self.entity ; "phase {} flow {} ({}) {}->{} {} bytes: {}, expecting {} segments",
            phase, index, flow.kind, flow.src_node, flow.dst_node, flow.payload_len, role, expected_segments);
        Ok(Installation {
            role,
            expected_segments,
            fresh: true,
        })
    }

    /// Number of flows started by this worker.
    #[must_use]
    pub fn num_senders(&self) -> usize {
        self.senders.borrow().len()
    }

    /// Number of started flows that have sent every byte.
    #[must_use]
    pub fn num_senders_complete(&self) -> usize {
        self.senders.borrow().iter().filter(|s| s.is_complete()).count()
    }
}
