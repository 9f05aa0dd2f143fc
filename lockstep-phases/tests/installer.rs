// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use lockstep_engine::types::SimResult;
use lockstep_group::LocalWorld;
use lockstep_models::endpoint::{ArrivalObserver, SegmentContext};
use lockstep_models::rdma::{QueuePairDriver, QueuePairRequest};
use lockstep_models::reception::ReceptionTracker;
use lockstep_phases::installer::{FlowInstaller, Role};
use lockstep_phases::workload::FlowDescriptor;
use lockstep_track::tracker::dev_null_tracker;

mod common;

#[derive(Default)]
struct Recorder(RefCell<Vec<QueuePairRequest>>);

impl QueuePairDriver for Recorder {
    fn add_queue_pair(
        &self,
        request: QueuePairRequest,
        _on_complete: Box<dyn FnOnce()>,
    ) -> SimResult {
        self.0.borrow_mut().push(request);
        Ok(())
    }
}

#[derive(Default)]
struct Count(Cell<u32>);

impl ArrivalObserver for Count {
    fn on_segment_arrived(&self, _ctx: &SegmentContext) -> SimResult {
        self.0.set(self.0.get() + 1);
        Ok(())
    }
}

fn flow(src: u32, dst: u32, size: u64) -> FlowDescriptor {
    FlowDescriptor {
        kind: "rdma_write".to_string(),
        src_node: src,
        src_port: 100,
        dst_node: dst,
        dst_port: 1,
        priority: 3,
        payload_len: size,
    }
}

/// Installer for rank `rank` of a two-process world.
fn installer(rank: usize) -> (FlowInstaller, Rc<Recorder>, Rc<ReceptionTracker>, Rc<Count>) {
    let group = LocalWorld::new(2).unwrap().into_groups().remove(rank);
    let (engine, _group, fabric) = common::worker(&dev_null_tracker(), group);
    let recorder = Rc::new(Recorder::default());
    let reception = ReceptionTracker::new(engine.top());
    let count = Rc::new(Count::default());
    let installer = FlowInstaller::new(
        engine.top(),
        &fabric,
        recorder.clone(),
        &reception,
        count.clone(),
        16,
    );
    (installer, recorder, reception, count)
}

#[test]
fn roles_follow_ownership() {
    let (installer, ..) = installer(0);
    assert_eq!(installer.role(&flow(0, 1, 1)).unwrap(), Role::Both);
    assert_eq!(installer.role(&flow(0, 40, 1)).unwrap(), Role::SenderOnly);
    assert_eq!(installer.role(&flow(40, 0, 1)).unwrap(), Role::ReceiverOnly);
    assert_eq!(installer.role(&flow(40, 41, 1)).unwrap(), Role::Neither);
    assert!(installer.role(&flow(0, 64, 1)).is_err());
}

#[test]
fn expected_segments_round_up() {
    let (installer, recorder, reception, _) = installer(0);
    assert_eq!(installer.install(0, 0, &flow(0, 1, 1448)).unwrap().expected_segments, 1);
    assert_eq!(installer.install(0, 1, &flow(2, 1, 3000)).unwrap().expected_segments, 3);
    assert_eq!(installer.install(0, 2, &flow(0, 40, 3000)).unwrap().expected_segments, 0);
    assert_eq!(reception.expected(0), 4);

    let requests = recorder.0.borrow();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[1].size, 3000);
    assert_eq!(requests[1].pg, 3);
    assert_eq!(requests[1].win, 16);
    assert_eq!(requests[1].dport, 1);
    assert_eq!(requests[1].dip.octets(), [10, 1, 1, 3]);
    assert!(requests[0].base_rtt_ns > 0);
}

#[test]
fn remote_flows_install_nothing() {
    let (installer, recorder, reception, _) = installer(1);
    let done = installer.install(0, 0, &flow(0, 1, 1000)).unwrap();
    assert_eq!(done.role, Role::Neither);
    assert_eq!(done.expected_segments, 0);
    assert!(recorder.0.borrow().is_empty());
    assert_eq!(reception.expected(0), 0);
    assert_eq!(installer.num_senders(), 0);
}

#[test]
fn installing_twice_counts_once() {
    let (installer, recorder, reception, count) = installer(0);
    let first = installer.install(0, 0, &flow(0, 1, 3000)).unwrap();
    let again = installer.install(0, 0, &flow(0, 1, 3000)).unwrap();
    assert!(first.fresh);
    assert!(!again.fresh);
    assert_eq!(first.expected_segments + again.expected_segments, 3);
    assert_eq!(reception.expected(0), 3);
    assert_eq!(recorder.0.borrow().len(), 1);
    assert_eq!(installer.num_senders(), 1);
    assert_eq!(count.0.get(), 0);
}

#[test]
fn flows_sharing_a_receiver_share_its_observers() {
    let (installer, _, reception, _) = installer(0);
    installer.install(0, 0, &flow(0, 1, 10)).unwrap();
    installer.install(0, 1, &flow(2, 1, 10)).unwrap();
    let next = FlowDescriptor {
        dst_port: 2,
        ..flow(0, 1, 10)
    };
    installer.install(1, 0, &next).unwrap();
    assert_eq!(reception.expected(0), 2);
    assert_eq!(reception.expected(1), 1);
}

#[test]
fn a_new_phase_releases_the_previous_one() {
    let group = LocalWorld::new(1).unwrap().into_groups().remove(0);
    let (engine, _group, fabric) = common::worker(&dev_null_tracker(), group);
    let reception = ReceptionTracker::new(engine.top());
    let installer = FlowInstaller::new(
        engine.top(),
        &fabric,
        Rc::new(Recorder::default()),
        &reception,
        Rc::new(Count::default()),
        0,
    );

    installer.start_phase(0);
    installer.install(0, 0, &flow(0, 1, 10)).unwrap();
    installer.install(0, 1, &flow(2, 3, 10)).unwrap();
    assert_eq!(installer.num_installed(), 2);
    assert_eq!(fabric.num_receivers(), 2);

    // Loading the same phase again keeps what it installed
    installer.start_phase(0);
    assert!(!installer.install(0, 0, &flow(0, 1, 10)).unwrap().fresh);

    installer.start_phase(1);
    assert_eq!(installer.num_installed(), 0);
    assert_eq!(fabric.num_receivers(), 0);
    assert!(fabric.receiver(1, 1).is_none());

    let next = FlowDescriptor {
        dst_port: 2,
        ..flow(0, 1, 10)
    };
    assert!(installer.install(1, 0, &next).unwrap().fresh);
    assert_eq!(installer.num_installed(), 1);
    assert!(fabric.receiver(1, 2).is_some());
    assert_eq!(reception.expected(1), 1);
}
