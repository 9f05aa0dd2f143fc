// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Queue-pair requests and the drivers that carry them out.
//!
//! A [`QueuePairRequest`] describes one reliable transfer: how many bytes,
//! between which addresses and ports, at what priority, and until when it
//! may run. Requests are built with an [`RdmaClient`]:
//!
//! ```rust
//! use std::net::Ipv4Addr;
//!
//! use lockstep_models::rdma::RdmaClient;
//!
//! let request = RdmaClient::new()
//!     .priority_group(3)
//!     .local(Ipv4Addr::new(10, 1, 1, 1), 100)
//!     .remote(Ipv4Addr::new(10, 2, 1, 1), 1)
//!     .write_size(3000)
//!     .request();
//! assert_eq!(request.size, 3000);
//! assert_eq!(request.dport, 1);
//! ```
//!
//! The congestion-controlled transport itself is not modelled. The
//! [`PacedDriver`] cuts each request into segments and sends them at line
//! rate through a [`FabricShard`]. A non-zero window limits the bytes in
//! flight: a segment counts as acknowledged one base RTT after it was sent.

use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::sync::Arc;

use lockstep_engine::sim_error;
use lockstep_engine::time::clock::Clock;
use lockstep_engine::types::SimResult;
use lockstep_track::entity::Entity;
use lockstep_track::{debug, trace, warn};

use crate::endpoint::SegmentContext;
use crate::fabric::FabricShard;
use crate::segments_for;

/// Stop time used when a transfer should run until it is explicitly stopped.
pub const LONG_CEILING_NS: f64 = 2.0e12;

#[derive(Clone, Debug, PartialEq)]
pub struct QueuePairRequest {
    /// Priority group, carried in the segment header as the queue index.
    pub pg: u8,
    pub sip: Ipv4Addr,
    pub dip: Ipv4Addr,
    pub sport: u16,
    pub dport: u16,
    /// Bytes to write.
    pub size: u64,
    /// Bytes in flight allowed by the transport, zero for unlimited.
    pub win: u32,
    pub base_rtt_ns: u64,
    /// The transfer gives up at this sim-time.
    pub stop_time_ns: f64,
}

impl Default for QueuePairRequest {
    fn default() -> Self {
        Self {
            pg: 0,
            sip: Ipv4Addr::UNSPECIFIED,
            dip: Ipv4Addr::UNSPECIFIED,
            sport: 0,
            dport: 0,
            size: 0,
            win: 0,
            base_rtt_ns: 0,
            stop_time_ns: LONG_CEILING_NS,
        }
    }
}

impl fmt::Display for QueuePairRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} pg{} {} bytes",
            self.sip, self.sport, self.dip, self.dport, self.pg, self.size
        )
    }
}

/// Builder for a [`QueuePairRequest`].
#[derive(Clone, Debug, Default)]
pub struct RdmaClient {
    request: QueuePairRequest,
}

impl RdmaClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn priority_group(mut self, pg: u8) -> Self {
        self.request.pg = pg;
        self
    }

    #[must_use]
    pub fn local(mut self, ip: Ipv4Addr, port: u16) -> Self {
        self.request.sip = ip;
        self.request.sport = port;
        self
    }

    #[must_use]
    pub fn remote(mut self, ip: Ipv4Addr, port: u16) -> Self {
        self.request.dip = ip;
        self.request.dport = port;
        self
    }

    #[must_use]
    pub fn write_size(mut self, size: u64) -> Self {
        self.request.size = size;
        self
    }

    #[must_use]
    pub fn window(mut self, win: u32) -> Self {
        self.request.win = win;
        self
    }

    #[must_use]
    pub fn base_rtt(mut self, base_rtt_ns: u64) -> Self {
        self.request.base_rtt_ns = base_rtt_ns;
        self
    }

    #[must_use]
    pub fn stop_time(mut self, stop_time_ns: f64) -> Self {
        self.request.stop_time_ns = stop_time_ns;
        self
    }

    #[must_use]
    pub fn request(self) -> QueuePairRequest {
        self.request
    }
}

/// Something that can carry out a [`QueuePairRequest`].
pub trait QueuePairDriver {
    /// Open a queue pair for `request`. `on_complete` is called once every
    /// byte has been handed to the network.
    fn add_queue_pair(
        &self,
        request: QueuePairRequest,
        on_complete: Box<dyn FnOnce()>,
    ) -> SimResult;
}

/// Sends the segments of a request at line rate within its window.
pub struct PacedDriver {
    pub entity: Arc<Entity>,
    fabric: Rc<FabricShard>,
    clock: Clock,
    next_qp: Cell<u16>,
}

impl PacedDriver {
    #[must_use]
    pub fn new(parent: &Arc<Entity>, fabric: &Rc<FabricShard>) -> Self {
        Self {
            entity: Arc::new(Entity::new(parent, "qp_driver")),
            fabric: fabric.clone(),
            clock: fabric.clock().clone(),
            next_qp: Cell::new(0),
        }
    }

    /// Number of queue pairs opened so far.
    #[must_use]
    pub fn num_queue_pairs(&self) -> u16 {
        self.next_qp.get()
    }
}

impl QueuePairDriver for PacedDriver {
    fn add_queue_pair(
        &self,
        request: QueuePairRequest,
        on_complete: Box<dyn FnOnce()>,
    ) -> SimResult {
        let partition = self.fabric.partition();
        let Some(src_node) = partition.node_of(request.sip) else {
            return sim_error!(format!("{}: no server has address {}", self.entity, request.sip));
        };
        let Some(dst_node) = partition.node_of(request.dip) else {
            return sim_error!(format!("{}: no server has address {}", self.entity, request.dip));
        };

        let qp = self.next_qp.get();
        self.next_qp.set(qp.wrapping_add(1));

        let segment_bytes = self.fabric.config().segment_bytes;
        let num_segments = segments_for(request.size, segment_bytes);
        debug!(self.entity ; "qp{} {} in {} segments", qp, request, num_segments);

        let entity = self.entity.clone();
        let fabric = self.fabric.clone();
        let clock = self.clock.clone();
        self.fabric.spawner().spawn(async move {
            let mut remaining = request.size;
            let mut in_flight = 0u64;
            let mut unacked: VecDeque<(u64, f64)> = VecDeque::new();
            for seq in 0..num_segments {
                if clock.time_now_ns() >= request.stop_time_ns {
                    warn!(entity ; "qp{} stopped after {} of {} segments", qp, seq, num_segments);
                    return Ok(());
                }
                let payload_len = remaining.min(u64::from(segment_bytes)) as u32;
                remaining -= u64::from(payload_len);

                if request.win > 0 {
                    while in_flight + u64::from(payload_len) > u64::from(request.win) {
                        let Some((bytes, acked_ns)) = unacked.pop_front() else {
                            break;
                        };
                        let now = clock.time_now_ns();
                        if acked_ns > now {
                            trace!(entity ; "qp{} window full, #{} waits", qp, seq);
                            clock.wait_ticks(clock.ns_to_ticks(acked_ns - now)).await;
                        }
                        in_flight -= bytes;
                    }
                }

                let ticks = clock.ns_to_ticks(fabric.serialisation_ns(payload_len));
                clock.wait_ticks(ticks).await;
                trace!(entity ; "qp{} tx #{}", qp, seq);
                fabric.transmit(SegmentContext {
                    flow_id: qp,
                    src_node,
                    dst_node,
                    dst_port: request.dport,
                    seq: seq as u32,
                    payload_len,
                    priority: request.pg,
                    arrival_ns: clock.time_now_ns(),
                })?;
                if request.win > 0 {
                    in_flight += u64::from(payload_len);
                    unacked.push_back((
                        u64::from(payload_len),
                        clock.time_now_ns() + request.base_rtt_ns as f64,
                    ));
                }
            }
            on_complete();
            Ok(())
        });
        Ok(())
    }
}
