// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Send and receive endpoints installed on servers.
//!
//! A [`Sender`] hands a single [`QueuePairRequest`] to a [`QueuePairDriver`]
//! and records when the transfer completes.
//!
//! A [`Receiver`] listens on one (node, port) pair and calls every registered
//! [`ArrivalObserver`] for each segment delivered to it. Observers are added
//! when flows are installed, so a receiver shared by several flows notifies
//! all of their observers.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use lockstep_engine::types::SimResult;
use lockstep_track::entity::Entity;
use lockstep_track::{debug, trace};

use crate::rdma::{QueuePairDriver, QueuePairRequest};

/// Everything known about one segment as it arrives at a [`Receiver`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SegmentContext {
    /// Queue pair the segment belongs to.
    pub flow_id: u16,
    pub src_node: u32,
    pub dst_node: u32,
    pub dst_port: u16,
    /// Position of the segment within its queue pair.
    pub seq: u32,
    pub payload_len: u32,
    pub priority: u8,
    pub arrival_ns: f64,
}

impl SegmentContext {
    /// Index of the phase the segment was sent in.
    ///
    /// Destination ports are numbered from one, so port 0 carries no phase.
    #[must_use]
    pub fn phase(&self) -> Option<usize> {
        usize::from(self.dst_port).checked_sub(1)
    }
}

impl fmt::Display for SegmentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "qp{}#{} {}->{}:{} ({} bytes)",
            self.flow_id, self.seq, self.src_node, self.dst_node, self.dst_port, self.payload_len
        )
    }
}

/// Subscriber notified of every segment delivered to a [`Receiver`].
pub trait ArrivalObserver {
    fn on_segment_arrived(&self, ctx: &SegmentContext) -> SimResult;
}

pub struct Receiver {
    pub entity: Arc<Entity>,
    node: u32,
    port: u16,
    observers: RefCell<Vec<Rc<dyn ArrivalObserver>>>,
    segments: Cell<u64>,
    bytes: Cell<u64>,
}

impl Receiver {
    #[must_use]
    pub fn new(parent: &Arc<Entity>, node: u32, port: u16) -> Rc<Self> {
        let entity = Arc::new(Entity::new(parent, &format!("server{node}::port{port}")));
        Rc::new(Self {
            entity,
            node,
            port,
            observers: RefCell::new(Vec::new()),
            segments: Cell::new(0),
            bytes: Cell::new(0),
        })
    }

    #[must_use]
    pub fn node(&self) -> u32 {
        self.node
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn add_observer(&self, observer: Rc<dyn ArrivalObserver>) {
        self.observers.borrow_mut().push(observer);
    }

    #[must_use]
    pub fn num_observers(&self) -> usize {
        self.observers.borrow().len()
    }

    /// Total segments delivered to this receiver.
    #[must_use]
    pub fn segments(&self) -> u64 {
        self.segments.get()
    }

    /// Total payload bytes delivered to this receiver.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes.get()
    }

    /// Deliver a segment and notify every observer.
    pub fn on_segment(&self, ctx: &SegmentContext) -> SimResult {
        self.segments.set(self.segments.get() + 1);
        self.bytes.set(self.bytes.get() + u64::from(ctx.payload_len));
        trace!(self.entity ; "rx {} at {:.1}ns", ctx, ctx.arrival_ns);

        // An observer may install further observers
        let observers = self.observers.borrow().clone();
        for observer in observers {
            observer.on_segment_arrived(ctx)?;
        }
        Ok(())
    }
}

impl fmt::Display for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.entity)
    }
}

pub struct Sender {
    pub entity: Arc<Entity>,
    request: QueuePairRequest,
    complete: Rc<Cell<bool>>,
}

impl Sender {
    #[must_use]
    pub fn new(parent: &Arc<Entity>, name: &str, request: QueuePairRequest) -> Rc<Self> {
        Rc::new(Self {
            entity: Arc::new(Entity::new(parent, name)),
            request,
            complete: Rc::new(Cell::new(false)),
        })
    }

    #[must_use]
    pub fn request(&self) -> &QueuePairRequest {
        &self.request
    }

    /// Hand the transfer to `driver`. It starts at the current time.
    pub fn start(&self, driver: &dyn QueuePairDriver) -> SimResult {
        debug!(self.entity ; "start {}", self.request);
        let complete = self.complete.clone();
        let entity = self.entity.clone();
        driver.add_queue_pair(
            self.request.clone(),
            Box::new(move || {
                debug!(entity ; "transfer complete");
                complete.set(true);
            }),
        )
    }

    /// Whether the driver reported that every byte was sent.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete.get()
    }
}
